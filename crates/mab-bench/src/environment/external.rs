use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use mab_core::{Environment, EnvironmentError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Level, event};

use crate::config::ExternalConfig;

/// Runs one simulator process per step.
///
/// The process receives `{"action":"step","arm":i,"timestep":t}` on stdin and must print
/// `{"reward":x}` on stdout.
#[derive(Debug, Clone)]
pub struct ExternalEnvironment {
    config: ExternalConfig,
}

impl ExternalEnvironment {
    pub fn new(config: ExternalConfig) -> Self {
        Self { config }
    }

    fn invoke(&self, request: &StepRequest) -> Result<StepResponse, ExternalInvokeError> {
        let mut cmd = Command::new(&self.config.command);
        if !self.config.args.is_empty() {
            cmd.args(&self.config.args);
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|err| ExternalInvokeError::Spawn(err.to_string()))?;
        if let Err(err) = write_request(&mut child, request) {
            abandon(&mut child);
            return Err(err);
        }

        let output = child
            .wait_with_output()
            .map_err(|err| ExternalInvokeError::Io(err.to_string()))?;

        if !output.status.success() {
            return Err(ExternalInvokeError::Status(format!(
                "exit status {}",
                output.status
            )));
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > self.config.timeout_ms as f64 {
            event!(
                target: "mab_bench::external",
                Level::WARN,
                command = %self.config.command,
                arm = request.arm,
                timestep = request.timestep,
                elapsed_ms,
                timeout_ms = self.config.timeout_ms,
                "external step exceeded timeout"
            );
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| ExternalInvokeError::Protocol(err.to_string()))
    }
}

/// Send `request` and close stdin so the child sees end of input.
fn write_request(child: &mut Child, request: &StepRequest) -> Result<(), ExternalInvokeError> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| ExternalInvokeError::Io("stdin".into()))?;
    serde_json::to_writer(&mut stdin, request)
        .map_err(|err| ExternalInvokeError::Protocol(err.to_string()))?;
    stdin
        .write_all(b"\n")
        .map_err(|err| ExternalInvokeError::Io(err.to_string()))
}

/// Kill and reap a child whose step is being abandoned.
fn abandon(child: &mut Child) {
    let _ = child.kill();
    if let Err(err) = child.wait() {
        event!(
            target: "mab_bench::external",
            Level::WARN,
            pid = child.id(),
            error = %err,
            "failed to reap abandoned simulator process"
        );
    }
}

impl Environment for ExternalEnvironment {
    fn num_actions(&self) -> usize {
        self.config.arms
    }

    fn step(&mut self, arm: usize, t: usize) -> Result<f64, EnvironmentError> {
        if arm >= self.config.arms {
            return Err(EnvironmentError::InvalidArm {
                arm,
                nr_arms: self.config.arms,
            });
        }
        let request = StepRequest {
            action: "step",
            arm,
            timestep: t,
        };
        let response = self.invoke(&request)?;
        if !response.reward.is_finite() {
            return Err(EnvironmentError::NonFiniteReward {
                arm,
                reward: response.reward,
            });
        }
        Ok(response.reward)
    }
}

#[derive(Debug, Error)]
enum ExternalInvokeError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("non-zero exit status: {0}")]
    Status(String),
}

impl From<ExternalInvokeError> for EnvironmentError {
    fn from(err: ExternalInvokeError) -> Self {
        EnvironmentError::failed(err.to_string())
    }
}

#[derive(Serialize)]
struct StepRequest {
    action: &'static str,
    arm: usize,
    timestep: usize,
}

#[derive(Deserialize)]
struct StepResponse {
    reward: f64,
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str, arms: usize) -> ExternalEnvironment {
        ExternalEnvironment::new(ExternalConfig {
            arms,
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            timeout_ms: 60_000,
        })
    }

    #[test]
    fn reads_reward_from_stdout() {
        let mut env = shell("cat > /dev/null; echo '{\"reward\": 0.25}'", 3);
        assert_eq!(env.num_actions(), 3);
        assert_eq!(env.step(2, 0).expect("step"), 0.25);
    }

    #[test]
    fn request_carries_arm_and_timestep() {
        let script = r#"read line; case "$line" in *'"arm":1'*'"timestep":7'*) echo '{"reward": 1.0}';; *) echo '{"reward": -1.0}';; esac"#;
        let mut env = shell(script, 2);
        assert_eq!(env.step(1, 7).expect("step"), 1.0);
        assert_eq!(env.step(0, 7).expect("step"), -1.0);
    }

    #[test]
    fn failing_process_is_a_step_error() {
        let mut env = shell("cat > /dev/null; exit 3", 2);
        let err = env.step(0, 0).expect_err("exit 3");
        assert!(matches!(err, EnvironmentError::Failed(msg) if msg.contains("exit status")));
    }

    #[test]
    fn malformed_response_is_a_protocol_error() {
        let mut env = shell("cat > /dev/null; echo 'not json'", 2);
        let err = env.step(0, 0).expect_err("bad json");
        assert!(matches!(err, EnvironmentError::Failed(msg) if msg.contains("protocol")));
    }

    #[test]
    fn missing_command_is_a_spawn_error() {
        let mut env = ExternalEnvironment::new(ExternalConfig {
            arms: 1,
            command: "/nonexistent/simulator".to_string(),
            args: Vec::new(),
            working_dir: None,
            timeout_ms: 10,
        });
        let err = env.step(0, 0).expect_err("spawn");
        assert!(matches!(err, EnvironmentError::Failed(msg) if msg.contains("spawn")));
    }

    #[test]
    fn abandoned_child_is_killed_and_reaped() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .spawn()
            .expect("spawn sleep");
        abandon(&mut child);
        let status = child.try_wait().expect("status").expect("child reaped");
        assert!(!status.success());
    }

    #[test]
    fn child_that_ignores_the_request_fails_the_step() {
        let mut env = shell("exec 0<&-; exit 0", 2);
        let err = env.step(0, 0).expect_err("no response");
        assert!(matches!(
            err,
            EnvironmentError::Failed(msg) if msg.contains("protocol") || msg.contains("I/O")
        ));
    }

    #[test]
    fn rejects_out_of_range_arm_without_spawning() {
        let mut env = shell("exit 1", 2);
        assert!(matches!(
            env.step(2, 0),
            Err(EnvironmentError::InvalidArm { arm: 2, nr_arms: 2 })
        ));
    }
}
