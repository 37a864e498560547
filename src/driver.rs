//! Boot a machine, feed it the recipe, power it off.

use std::time::Duration;

use crate::backend::{GuestConsole, Machine};
use crate::error::MkvmError;
use crate::progress::StepProgress;
use crate::util::command_label;

/// Steps shown by the progress UI: boot, login, each command, halt.
pub fn total_steps(commands: usize) -> usize {
    commands + 3
}

/// Run `commands` on a fresh session of `machine`, one at a time.
///
/// A failure in boot, login or any command aborts the run and is returned
/// without halting; the QEMU child dies with the machine. A failed halt is
/// only logged.
pub async fn provision<M: Machine>(
    machine: &mut M,
    commands: &[String],
    command_timeout: Duration,
    progress: &mut StepProgress,
) -> Result<(), MkvmError> {
    let m = &mut *machine;
    let mut console = progress
        .run("Booting VM", move |_| async move { m.boot().await })
        .await?;

    let result = run_session(&mut console, commands, command_timeout, progress).await;
    if let Some(transcript) = console.finish(result.is_ok()) {
        progress.info(&format!("console log: {}", transcript.display()));
    }
    result?;

    let m = &mut *machine;
    let halted = progress
        .run("Powering off", move |step| async move {
            let r = m.halt().await;
            if r.is_err() {
                step.set_done_label("Powering off (gave up)");
            }
            r
        })
        .await;
    if let Err(e) = halted {
        tracing::warn!(error = %e, "halt failed, assuming the guest is off");
    }

    Ok(())
}

async fn run_session<C: GuestConsole>(
    console: &mut C,
    commands: &[String],
    command_timeout: Duration,
    progress: &mut StepProgress,
) -> Result<(), MkvmError> {
    let c = &mut *console;
    progress
        .run("Logging in", move |_| async move { c.login().await })
        .await?;

    for command in commands {
        let label = format!("Running {}", command_label(command));
        tracing::info!(command = %command_label(command), "running guest command");
        let c = &mut *console;
        progress
            .run(&label, move |step| async move {
                // Heredocs only show their first line in the label
                if command.contains('\n') {
                    step.log(command);
                }
                c.run_command(command, command_timeout).await
            })
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::OutputMode;
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<String>>>;

    #[derive(Default)]
    struct Faults {
        boot: bool,
        login: bool,
        fail_command: Option<&'static str>,
        halt: bool,
    }

    struct FakeMachine {
        journal: Journal,
        faults: Faults,
    }

    struct FakeConsole {
        journal: Journal,
        fail_login: bool,
        fail_command: Option<&'static str>,
    }

    impl Machine for FakeMachine {
        type Console = FakeConsole;

        async fn boot(&mut self) -> Result<FakeConsole, MkvmError> {
            self.journal.lock().unwrap().push("boot".into());
            if self.faults.boot {
                return Err(MkvmError::ExternalCommand {
                    command: "qemu-system-x86_64".into(),
                    message: "no such file".into(),
                });
            }
            Ok(FakeConsole {
                journal: self.journal.clone(),
                fail_login: self.faults.login,
                fail_command: self.faults.fail_command,
            })
        }

        async fn halt(&mut self) -> Result<(), MkvmError> {
            self.journal.lock().unwrap().push("halt".into());
            if self.faults.halt {
                return Err(MkvmError::Timeout {
                    what: "the guest to power off".into(),
                    secs: 300,
                });
            }
            Ok(())
        }
    }

    impl GuestConsole for FakeConsole {
        async fn login(&mut self) -> Result<(), MkvmError> {
            self.journal.lock().unwrap().push("login".into());
            if self.fail_login {
                return Err(MkvmError::ConsoleClosed {
                    waiting_for: "login: ".into(),
                });
            }
            Ok(())
        }

        async fn run_command(&mut self, command: &str, timeout: Duration) -> Result<(), MkvmError> {
            assert_eq!(timeout, Duration::from_secs(3600));
            self.journal.lock().unwrap().push(format!("run {command}"));
            if self.fail_command == Some(command) {
                return Err(MkvmError::CommandFailed {
                    command: command.to_string(),
                    status: 1,
                });
            }
            Ok(())
        }

        fn finish(&mut self, success: bool) -> Option<std::path::PathBuf> {
            self.journal.lock().unwrap().push(format!("finish {success}"));
            Some(format!("logs/console_{success}.log").into())
        }
    }

    fn commands() -> Vec<String> {
        vec!["pkgin update".into(), "touch /etc/x".into(), "shutdown -h now".into()]
    }

    async fn run(faults: Faults) -> (Result<(), MkvmError>, Vec<String>) {
        let journal = Journal::default();
        let mut machine = FakeMachine {
            journal: journal.clone(),
            faults,
        };
        let cmds = commands();
        let mut progress = StepProgress::new(total_steps(cmds.len()), OutputMode::Silent);
        let result = provision(&mut machine, &cmds, Duration::from_secs(3600), &mut progress).await;
        let entries = journal.lock().unwrap().clone();
        (result, entries)
    }

    #[tokio::test]
    async fn runs_everything_in_order() {
        let (result, journal) = run(Faults::default()).await;
        result.unwrap();
        assert_eq!(
            journal,
            vec![
                "boot",
                "login",
                "run pkgin update",
                "run touch /etc/x",
                "run shutdown -h now",
                "finish true",
                "halt",
            ]
        );
    }

    #[tokio::test]
    async fn failing_command_aborts_without_halt() {
        let (result, journal) = run(Faults {
            fail_command: Some("touch /etc/x"),
            ..Faults::default()
        })
        .await;
        assert!(matches!(result, Err(MkvmError::CommandFailed { status: 1, .. })));
        assert_eq!(
            journal,
            vec!["boot", "login", "run pkgin update", "run touch /etc/x", "finish false"]
        );
    }

    #[tokio::test]
    async fn halt_failure_is_swallowed() {
        let (result, journal) = run(Faults {
            halt: true,
            ..Faults::default()
        })
        .await;
        result.unwrap();
        assert_eq!(journal.last().map(String::as_str), Some("halt"));
    }

    #[tokio::test]
    async fn boot_failure_propagates() {
        let (result, journal) = run(Faults {
            boot: true,
            ..Faults::default()
        })
        .await;
        assert!(matches!(result, Err(MkvmError::ExternalCommand { .. })));
        assert_eq!(journal, vec!["boot"]);
    }

    #[tokio::test]
    async fn login_failure_skips_commands() {
        let (result, journal) = run(Faults {
            login: true,
            ..Faults::default()
        })
        .await;
        assert!(matches!(result, Err(MkvmError::ConsoleClosed { .. })));
        assert_eq!(journal, vec!["boot", "login", "finish false"]);
    }

    #[tokio::test]
    async fn heredoc_runs_as_one_command() {
        let journal = Journal::default();
        let mut machine = FakeMachine {
            journal: journal.clone(),
            faults: Faults::default(),
        };
        let cmds = vec!["cat > /etc/ifconfig.vioif0 << EOF\n!dhcpcd\nmtu 1460\nEOF".to_string()];
        let mut progress = StepProgress::new(total_steps(cmds.len()), OutputMode::Silent);
        provision(&mut machine, &cmds, Duration::from_secs(3600), &mut progress)
            .await
            .unwrap();
        assert_eq!(progress.current_step(), total_steps(1));
        assert_eq!(
            journal.lock().unwrap()[2],
            "run cat > /etc/ifconfig.vioif0 << EOF\n!dhcpcd\nmtu 1460\nEOF"
        );
    }

    #[test]
    fn step_count() {
        assert_eq!(total_steps(15), 18);
    }
}
