//! The `service` subcommand: start, stop, and inspect the daemon process.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::cli::{ServiceAction, ServiceArgs};

pub fn service(args: &ServiceArgs) -> anyhow::Result<()> {
    match &args.action {
        ServiceAction::Start { args } => start(args),
        ServiceAction::Stop => stop(),
        ServiceAction::Status => status(),
    }
}

/// Find the live `fluxrun run` process, skipping ourselves.
fn find_runner(system: &System) -> Option<(Pid, &sysinfo::Process)> {
    let self_pid = std::process::id();
    system.processes().iter().find_map(|(pid, process)| {
        if pid.as_u32() == self_pid {
            return None;
        }
        let cmd: Vec<String> = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let is_runner = cmd
            .first()
            .is_some_and(|program| program.contains("fluxrun"))
            && cmd.iter().any(|arg| arg == "run");
        is_runner.then_some((*pid, process))
    })
}

fn start(extra: &[String]) -> anyhow::Result<()> {
    let system = System::new_all();
    if find_runner(&system).is_some() {
        println!("Daemon is already running");
        return Ok(());
    }

    let exe = std::env::current_exe().context("locate the fluxrun executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("run")
        .args(extra)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Detach from this terminal's process group.
        command.process_group(0);
    }
    command.spawn().context("start the daemon")?;
    println!("Daemon started.");
    Ok(())
}

fn stop() -> anyhow::Result<()> {
    let mut system = System::new_all();
    let Some((pid, _)) = find_runner(&system) else {
        println!("Daemon is not running");
        return Ok(());
    };

    terminate(pid)?;

    for _ in 0..50 {
        std::thread::sleep(Duration::from_millis(100));
        system.refresh_processes(ProcessesToUpdate::All, true);
        if find_runner(&system).is_none() {
            println!("Daemon stopped.");
            return Ok(());
        }
    }
    anyhow::bail!("daemon (pid {pid}) did not stop within 5 seconds")
}

#[cfg(unix)]
fn terminate(pid: Pid) -> anyhow::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid as NixPid;

    kill(NixPid::from_raw(pid.as_u32() as i32), Signal::SIGTERM).context("signal the daemon")?;
    Ok(())
}

#[cfg(windows)]
fn terminate(pid: Pid) -> anyhow::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.as_u32().to_string()])
        .status()
        .context("run taskkill")?;
    if !status.success() {
        anyhow::bail!("taskkill exited with {status}");
    }
    Ok(())
}

fn status() -> anyhow::Result<()> {
    let mut system = System::new_all();
    // Sample twice so the CPU percentage is meaningful.
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_processes(ProcessesToUpdate::All, true);

    match find_runner(&system) {
        Some((pid, process)) => {
            println!("Daemon is running (PID: {pid})");
            println!("  Uptime: {}s", process.run_time());
            println!("  CPU: {:.1}%", process.cpu_usage());
            println!(
                "  Memory: {:.1} MB",
                process.memory() as f64 / 1024.0 / 1024.0
            );
        }
        None => println!("Daemon is not running"),
    }
    Ok(())
}
