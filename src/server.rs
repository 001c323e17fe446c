//! Process lifecycle for the server under test.
//!
//! [`ServerBin`] names the executable (override with `SALTCORN_BIN`) and
//! runs its administrative CLI for out-of-band state manipulation: schema
//! reset, fixture loading, config keys, tenants and users. [`ServerBin::open`]
//! spawns the long-running `serve` process (or attaches to an externally
//! managed one) and blocks until the port answers an HTTP probe.
//! [`ServerHandle::close`] kills forcefully; there is no graceful-shutdown
//! handshake to model.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info};

/// Startup probe budget: 30 attempts at 250 ms spacing, ~7.5 s ceiling.
/// This is the only retry logic in the harness.
const READY_ATTEMPTS: u32 = 30;
const READY_INTERVAL: Duration = Duration::from_millis(250);

/// The server-under-test executable.
#[derive(Debug, Clone)]
pub struct ServerBin {
    program: PathBuf,
}

/// How to open an instance: which port, whether to spawn a process at all,
/// environment overrides merged over the inherited environment, and whether
/// to stream subprocess output into the log.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub spawn: bool,
    pub env: HashMap<String, String>,
    pub stream_output: bool,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            spawn: true,
            env: HashMap::new(),
            stream_output: false,
        }
    }

    /// Probe an externally managed instance instead of spawning one. Used
    /// when several logical sessions share one running server.
    pub fn attach(port: u16) -> Self {
        Self {
            spawn: false,
            ..Self::new(port)
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stream_output(mut self) -> Self {
        self.stream_output = true;
        self
    }
}

impl ServerBin {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `SALTCORN_BIN` from the environment, falling back to `saltcorn` on
    /// the PATH.
    pub fn from_env() -> Self {
        let program = std::env::var_os("SALTCORN_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("saltcorn"));
        Self::new(program)
    }

    /// Run the administrative CLI synchronously, returning captured stdout.
    /// A non-zero exit is fatal and carries the captured output.
    pub async fn cli<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        debug!("running {} {:?}", self.program.display(), args);
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running {} {args:?}", self.program.display()))?;
        if !output.status.success() {
            bail!(
                "{} {:?} exited with {}: {}{}",
                self.program.display(),
                args,
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Restore the database to the known fixture baseline.
    pub async fn reset_to_fixtures(&self) -> Result<()> {
        self.cli(["reset-schema", "-f"]).await?;
        self.cli(["fixtures"]).await?;
        Ok(())
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.cli(["set-cfg", key, value]).await?;
        Ok(())
    }

    pub async fn set_plugin_config(&self, plugin: &str, key: &str, value: &str) -> Result<()> {
        self.cli(["set-cfg", "-p", plugin, key, value]).await?;
        Ok(())
    }

    pub async fn create_tenant(&self, subdomain: &str) -> Result<()> {
        self.cli(["create-tenant", subdomain]).await?;
        Ok(())
    }

    pub async fn remove_tenant(&self, subdomain: &str) -> Result<()> {
        self.cli(["rm-tenant", subdomain]).await?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        email: &str,
        password: &str,
        admin: bool,
        tenant: Option<&str>,
    ) -> Result<()> {
        let mut args = vec!["create-user", "-e", email, "-p", password];
        if admin {
            args.push("-a");
        }
        if let Some(tenant) = tenant {
            args.push("-t");
            args.push(tenant);
        }
        self.cli(args).await?;
        Ok(())
    }

    /// Spawn `serve -p <port>` (or just probe, with [`ServerConfig::attach`])
    /// and block until the root URL answers. Fails with a startup-timeout
    /// error once the probe budget is spent; a spawned child is killed on
    /// that path.
    pub async fn open(&self, config: ServerConfig) -> Result<ServerHandle> {
        let mut child = None;
        if config.spawn {
            info!("starting {} on port {}", self.program.display(), config.port);
            let mut command = Command::new(&self.program);
            command
                .arg("serve")
                .arg("-p")
                .arg(config.port.to_string())
                .stdin(Stdio::null())
                .kill_on_drop(true);
            for (key, value) in &config.env {
                command.env(key, value);
            }
            if config.stream_output {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            } else {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            let mut spawned = command.spawn().with_context(|| {
                format!("spawning {} on port {}", self.program.display(), config.port)
            })?;
            if config.stream_output {
                stream_child_output(config.port, &mut spawned);
            }
            child = Some(spawned);
        }
        let mut handle = ServerHandle {
            port: config.port,
            child,
        };
        if let Err(err) = wait_until_ready(config.port).await {
            handle.close().await;
            return Err(err);
        }
        Ok(handle)
    }
}

/// A spawned (or attached) server instance. Exclusively owns its process
/// identity; the child is killed on [`ServerHandle::close`] and, as a
/// backstop, when the handle is dropped.
#[derive(Debug)]
pub struct ServerHandle {
    port: u16,
    child: Option<Child>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    /// Kill the spawned process. Idempotent; a no-op for attached handles.
    /// Kill failures (process already dead) are logged and swallowed.
    pub async fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("stopping server on port {}", self.port);
            if let Err(err) = child.start_kill() {
                error!("failed to kill server on port {}: {err:#}", self.port);
            }
            let _ = child.wait().await;
        }
    }
}

/// Bundled asset file shipped with the harness, by name.
pub fn fixture_file(name: &str) -> PathBuf {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into());
    Path::new(&manifest_dir).join("fixtures").join(name)
}

async fn wait_until_ready(port: u16) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("building probe client")?;
    let url = format!("http://127.0.0.1:{port}/");
    // The budget is total elapsed time, not attempt count: a slow probe
    // (e.g. a port that drops packets) is cut off at the deadline instead
    // of stretching it.
    let deadline = Instant::now() + READY_INTERVAL * READY_ATTEMPTS;
    for attempt in 1..=READY_ATTEMPTS {
        // Any HTTP response counts: the probe checks reachability, not health.
        match timeout_at(deadline, client.get(&url).send()).await {
            Ok(Ok(_)) => {
                debug!("port {port} answered after {attempt} probes");
                return Ok(());
            }
            Ok(Err(err)) => debug!("probe {attempt}/{READY_ATTEMPTS} for {url}: {err}"),
            Err(_) => break,
        }
        if Instant::now() + READY_INTERVAL > deadline {
            break;
        }
        sleep(READY_INTERVAL).await;
    }
    Err(anyhow!(
        "server on port {port} did not come up within {READY_ATTEMPTS} probes"
    ))
}

/// Forward the child's stdout/stderr line-by-line into the log. The tasks
/// are fire-and-forget; they end when the pipes close after the kill.
fn stream_child_output(port: u16, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(port, "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(port, "stderr", stderr));
    }
}

async fn forward_lines(port: u16, stream: &'static str, reader: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "sut", port, stream, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(target: "sut", port, stream, "output stream ended: {err}");
                break;
            }
        }
    }
}
