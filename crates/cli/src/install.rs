//! The `install` subcommand: interactive setup, registration with the
//! control plane, config creation, and optional auto-start.

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use url::Url;
use uuid::Uuid;

use fluxrun_core::config::{
    FileManagerConfig, JobManagerConfig, LoggingConfig, RunnerConfig, ServerProxyConfig,
};
use fluxrun_core::files::{self, FileManager};
use fluxrun_engine::register_runner;

use crate::cli::InstallArgs;

const DEFAULT_API_URL: &str = "https://api.flux-compute.com";

/// Walks the configuration schema one setting at a time: each entry has a
/// label, a description, and a default that an empty answer accepts.
struct Prompter {
    use_defaults: bool,
    show_descriptions: bool,
}

impl Prompter {
    fn ask<T>(&self, label: &str, description: &str, default: T) -> anyhow::Result<T>
    where
        T: std::str::FromStr + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        if self.use_defaults {
            return Ok(default);
        }
        if self.show_descriptions {
            println!("  {description}");
        }
        loop {
            let line = prompt_line(&format!("{label} [{default}]: "))?;
            if line.is_empty() {
                return Ok(default);
            }
            match line.parse() {
                Ok(value) => return Ok(value),
                Err(err) => println!("Invalid value: {err}"),
            }
        }
    }
}

fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    let mut out = std::io::stdout();
    out.write_all(prompt.as_bytes())?;
    out.flush()?;

    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

pub async fn install(args: InstallArgs) -> anyhow::Result<()> {
    println!("Welcome to the fluxrun runner setup.");
    println!("Press ENTER to accept a default.");

    let prompter = Prompter {
        use_defaults: args.use_defaults,
        show_descriptions: args.descriptions,
    };
    let file_defaults = FileManagerConfig::default();

    let name: String = prompter.ask(
        "Runner name",
        "Display name used when registering with the control plane",
        "unnamed_runner".to_string(),
    )?;
    let api_url: Url = prompter.ask(
        "API URL",
        "HTTPS endpoint of the control plane",
        Url::parse(DEFAULT_API_URL).context("default API URL")?,
    )?;
    let api_port: u16 = prompter.ask("API port", "Port of the control plane API", 443)?;
    let report_interval: u64 = prompter.ask(
        "Report interval (seconds)",
        "Seconds between heartbeat status reports",
        600,
    )?;
    let working_directory: String = prompter.ask(
        "Working directory",
        "Root of the runner's own directory tree",
        file_defaults.working_directory.display().to_string(),
    )?;
    let simulation_directory: String = prompter.ask(
        "Simulation directory",
        "Where job case directories are created; relative paths resolve against the working directory",
        file_defaults.simulation_directory.display().to_string(),
    )?;
    let max_concurrent_jobs: usize = prompter.ask(
        "Max concurrent jobs",
        "Upper bound on jobs executing at the same time",
        4,
    )?;

    let mut config = RunnerConfig {
        logging: LoggingConfig::default(),
        file_manager: FileManagerConfig {
            working_directory: PathBuf::from(working_directory),
            simulation_directory: PathBuf::from(simulation_directory),
        },
        server_proxy: ServerProxyConfig {
            name,
            id: Uuid::new_v4(),
            token: Uuid::new_v4(),
            api_url,
            api_port,
            report_interval,
        },
        job_manager: JobManagerConfig {
            max_concurrent_jobs,
            ..JobManagerConfig::default()
        },
    };
    config.validate().context("configuration rejected")?;

    println!("Setting up the runner directory tree...");
    let file_manager = FileManager::new(&config.file_manager);
    file_manager
        .init_directories()
        .context("create runner directories")?;

    println!("Registering with the control plane...");
    let registration = match register_runner(&config.server_proxy).await {
        Ok(registration) => registration,
        Err(err) => {
            // Leave no half-installed tree behind.
            let _ = file_manager.remove_directories(false);
            anyhow::bail!("failed to register with the control plane: {err}");
        }
    };
    // The server may assign the canonical name and a fresh token.
    if let Some(assigned) = registration.name {
        config.server_proxy.name = assigned;
    }
    if let Some(assigned) = registration.token {
        config.server_proxy.token = assigned;
    }

    let config_path = file_manager
        .config_dir()
        .join(format!("{}.yaml", config.server_proxy.name));
    config.save(&config_path).context("save configuration")?;
    files::write_default_config_path(&config_path).context("record default config path")?;
    println!("Configuration saved to {}", config_path.display());

    if !args.use_defaults {
        let answer = prompt_line("Add fluxrun to startup applications [y/N]: ")?;
        if matches!(answer.to_lowercase().as_str(), "y" | "yes") {
            match setup_auto_start() {
                Ok(()) => println!("Auto-start enabled."),
                Err(err) => {
                    println!("Warning: could not enable auto-start: {err:#}");
                    println!("You can enable it manually later.");
                }
            }
        }
    }

    println!("Setup completed successfully.");
    Ok(())
}

#[cfg(target_os = "linux")]
fn setup_auto_start() -> anyhow::Result<()> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    let unit_dir = PathBuf::from(home).join(".config/systemd/user");
    std::fs::create_dir_all(&unit_dir)?;

    let exe = std::env::current_exe().context("locate the fluxrun executable")?;
    let unit = format!(
        "[Unit]\n\
         Description=Fluxrun compute runner\n\
         After=network.target\n\n\
         [Service]\n\
         Type=simple\n\
         ExecStart={} run\n\
         Restart=on-failure\n\
         RestartSec=5s\n\n\
         [Install]\n\
         WantedBy=default.target\n",
        exe.display()
    );
    std::fs::write(unit_dir.join("fluxrun.service"), unit)?;

    run_command("systemctl", &["--user", "daemon-reload"])?;
    run_command("systemctl", &["--user", "enable", "fluxrun.service"])?;
    Ok(())
}

#[cfg(target_os = "macos")]
fn setup_auto_start() -> anyhow::Result<()> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    let agents_dir = PathBuf::from(home).join("Library/LaunchAgents");
    std::fs::create_dir_all(&agents_dir)?;

    let exe = std::env::current_exe().context("locate the fluxrun executable")?;
    let plist = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>com.fluxrun.runner</string>
    <key>ProgramArguments</key>
    <array>
        <string>{}</string>
        <string>run</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
</dict>
</plist>
"#,
        exe.display()
    );
    std::fs::write(agents_dir.join("com.fluxrun.runner.plist"), plist)?;
    Ok(())
}

#[cfg(target_os = "windows")]
fn setup_auto_start() -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("locate the fluxrun executable")?;
    run_command(
        "schtasks",
        &[
            "/create",
            "/tn",
            "Fluxrun",
            "/tr",
            &format!("\"{}\" run", exe.display()),
            "/sc",
            "onlogon",
            "/f",
        ],
    )
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn setup_auto_start() -> anyhow::Result<()> {
    anyhow::bail!("auto-start is not supported on this platform")
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = std::process::Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("run {program}"))?;
    if !status.success() {
        anyhow::bail!("{program} exited with {status}");
    }
    Ok(())
}
