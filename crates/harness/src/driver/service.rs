//! WebDriver service management - spawning and health checking driver binaries

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::driver::Engine;
use crate::error::{HarnessError, HarnessResult};

/// How long a driver gets to exit after SIGTERM before it is killed
const STOP_GRACE: Duration = Duration::from_millis(200);

/// Handle to a running geckodriver / chromedriver process
pub struct DriverService {
    child: Option<Child>,
    engine: Engine,
    pub url: String,
    pub port: u16,
}

impl DriverService {
    /// Spawn the driver binary for `engine` and wait until it accepts sessions
    pub async fn spawn(engine: Engine, config: &EngineConfig) -> HarnessResult<Self> {
        let port = match config.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let url = format!("http://127.0.0.1:{}", port);
        let binary = config
            .driver_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(engine.default_driver_binary()));

        info!("Spawning {} on port {}", binary.display(), port);

        let mut cmd = Command::new(&binary);
        match engine {
            Engine::Firefox => cmd.arg("--port").arg(port.to_string()),
            Engine::Chrome => cmd.arg(format!("--port={}", port)),
        };
        cmd.stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| HarnessError::SessionUnavailable {
            engine: engine.to_string(),
            reason: format!("failed to spawn {}: {}", binary.display(), e),
        })?;

        let mut service = DriverService {
            child: Some(child),
            engine,
            url,
            port,
        };

        // Dropping `service` on the error path kills the child.
        service.wait_for_ready(config.startup_timeout()).await?;

        info!("{} driver ready at {}", engine, service.url);
        Ok(service)
    }

    /// Poll the W3C `/status` endpoint until the driver reports ready
    async fn wait_for_ready(&mut self, timeout_duration: Duration) -> HarnessResult<()> {
        let status_url = format!("{}/status", self.url);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = std::time::Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(HarnessError::SessionUnavailable {
                        engine: self.engine.to_string(),
                        reason: format!("driver exited during startup ({})", status),
                    });
                }
            }

            match client.get(&status_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await.unwrap_or_default();
                    // Drivers without the `ready` flag are treated as ready
                    let ready = body
                        .pointer("/value/ready")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(true);
                    if ready {
                        return Ok(());
                    }
                    debug!("Driver reachable but not ready yet");
                }
                Ok(resp) => {
                    warn!("Driver status check returned {}", resp.status());
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for {} driver to start...", self.engine);
                    }
                    // Connection refused is expected while the driver is starting
                    if !e.is_connect() {
                        warn!("Driver status check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(HarnessError::SessionUnavailable {
            engine: self.engine.to_string(),
            reason: format!("driver not ready after {} status checks", attempts),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop the driver process. Safe to call more than once.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("Stopping {} driver (pid: {:?})", self.engine, child.id());

        // Try graceful shutdown first
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(id) = child.id() {
                if kill(Pid::from_raw(id as i32), Signal::SIGTERM).is_ok()
                    && timeout(STOP_GRACE, child.wait()).await.is_ok()
                {
                    return;
                }
            }
        }

        // Force kill if still running
        if let Err(e) = child.kill().await {
            debug!("Driver already gone: {}", e);
        }
    }
}

impl Drop for DriverService {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Find a free local port for a spawned driver
fn find_free_port() -> HarnessResult<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port() {
        let port = find_free_port().unwrap();
        assert!(port > 1024);
    }

    fn service_for(cmd: &mut Command) -> DriverService {
        DriverService {
            child: Some(cmd.kill_on_drop(true).spawn().unwrap()),
            engine: Engine::Firefox,
            url: "http://127.0.0.1:0".to_string(),
            port: 0,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_gracefully_and_is_idempotent() {
        let mut service = service_for(Command::new("sleep").arg("30"));
        timeout(Duration::from_secs(5), service.stop()).await.unwrap();
        assert!(service.child.is_none());
        service.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_driver_ignoring_sigterm() {
        let mut service =
            service_for(Command::new("sh").args(["-c", "trap '' TERM; sleep 30"]));
        // Let the shell install its trap
        sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        timeout(Duration::from_secs(5), service.stop()).await.unwrap();
        assert!(started.elapsed() >= STOP_GRACE);
        assert!(service.child.is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_session_unavailable() {
        let config = EngineConfig {
            driver_path: Some(PathBuf::from("/nonexistent/mapshot-driver")),
            startup_timeout_ms: 200,
            ..Default::default()
        };
        let err = DriverService::spawn(Engine::Firefox, &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::SessionUnavailable { .. }));
    }
}
