//! Capability probe: one-time discovery of the remote host's resource limits
//! and scripting environment.
//!
//! Probing is best-effort. Steps that print nothing leave their fields at
//! zero; only a failing command or output that does not match the expected
//! document shape is an error.

use crate::channel::{open_shell_within, run_within, RemoteHost};
use crate::dialect::{Dialect, ProbeStep};
use crate::error::ProbeError;
use crate::protocol::timeouts;
use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitySnapshot {
    pub winrm: WinrmConfig,
    pub powershell: PowerShellSettings,
}

/// Management-service configuration (`winrm/config`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WinrmConfig {
    pub max_envelope_size_kb: u64,
    pub max_timeout_ms: u64,
    pub service: ServiceLimits,
    pub winrs: ShellLimits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceLimits {
    pub max_connections: u64,
    pub max_concurrent_operations: u64,
    pub max_concurrent_operations_per_user: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShellLimits {
    pub max_memory_per_shell_mb: u64,
    pub max_shells_per_user: u64,
    pub max_concurrent_users: u64,
    pub max_processes_per_shell: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PowerShellSettings {
    pub version: String,
    pub execution_policy: String,
}

impl CapabilitySnapshot {
    /// Envelope budget in bytes; 0 when the host did not say.
    pub fn envelope_bytes(&self) -> usize {
        usize::try_from(self.winrm.max_envelope_size_kb)
            .unwrap_or(usize::MAX)
            .saturating_mul(1024)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.winrm.max_timeout_ms > 0).then(|| Duration::from_millis(self.winrm.max_timeout_ms))
    }

    /// How many transfers may run at once against this host.
    pub fn parallelism(&self, ceiling: usize) -> usize {
        let ceiling = ceiling.max(1);
        [
            self.winrm.service.max_concurrent_operations_per_user,
            self.winrm.winrs.max_shells_per_user,
        ]
        .into_iter()
        .filter(|&limit| limit > 0)
        .min()
        .map_or(ceiling, |limit| usize::try_from(limit).unwrap_or(usize::MAX).min(ceiling))
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Surface stderr from the probe commands
    pub debug: bool,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            debug: false,
            connect_timeout: Duration::from_millis(timeouts::CONNECT_MS),
            operation_timeout: Duration::from_millis(timeouts::OPERATION_MS),
        }
    }
}

/// Run the discovery commands, each on its own shell.
pub async fn probe<H>(host: &H, dialect: Dialect, options: &ProbeOptions) -> Result<CapabilitySnapshot, ProbeError>
where
    H: RemoteHost + ?Sized,
{
    let mut snapshot = CapabilitySnapshot::default();

    for step in ProbeStep::ALL {
        let Some(command) = dialect.probe_command(step) else {
            debug!("probe: {dialect} has no {} step", step.name());
            continue;
        };

        let stdout = run_step(host, step, &command, options).await?;
        if stdout.trim().is_empty() {
            debug!("probe: {} returned nothing", step.name());
            continue;
        }

        let parse_err = |reason: String| ProbeError::Parse {
            step: step.name(),
            reason,
        };
        match step {
            ProbeStep::Version => {
                snapshot.powershell.version = parse_version_table(&stdout).map_err(parse_err)?;
            }
            ProbeStep::ExecutionPolicy => {
                snapshot.powershell.execution_policy =
                    stdout.trim_end_matches(['\r', '\n']).to_string();
            }
            ProbeStep::ServiceConfig => {
                snapshot.winrm = parse_service_config(&stdout).map_err(parse_err)?;
            }
        }
    }

    debug!("probe: {snapshot:?}");
    Ok(snapshot)
}

async fn run_step<H>(host: &H, step: ProbeStep, command: &str, options: &ProbeOptions) -> Result<String, ProbeError>
where
    H: RemoteHost + ?Sized,
{
    let channel_err = |source| ProbeError::Channel {
        step: step.name(),
        source,
    };
    // dropped at the end of the step
    let mut shell = open_shell_within(host, options.connect_timeout)
        .await
        .map_err(channel_err)?;
    let output = run_within(shell.as_mut(), command, options.operation_timeout)
        .await
        .map_err(channel_err)?;

    if options.debug && !output.stderr.trim().is_empty() {
        warn!("probe {} stderr: {}", step.name(), output.stderr.trim());
    }
    if !output.success() {
        return Err(ProbeError::Status {
            step: step.name(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

fn new_reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(xml.trim_start_matches('\u{feff}').trim().as_bytes());
    reader.config_mut().trim_text(true);
    reader
}

/// First object of a `ConvertTo-Xml` object list. Property values are joined
/// with `.` (`5.1.17763.1432`); an object without properties yields its text.
pub fn parse_version_table(xml: &str) -> Result<String, String> {
    let mut reader = new_reader(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut seen_root = false;
    let mut object_text = String::new();
    let mut properties: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if stack.is_empty() {
                    if name != "Objects" {
                        return Err(format!("expected <Objects>, found <{name}>"));
                    }
                    seen_root = true;
                }
                stack.push(name);
            }
            Ok(Event::End(_)) => {
                let closed = stack.pop();
                // only the first object counts
                if stack.len() == 1 && closed.as_deref() == Some("Object") {
                    break;
                }
            }
            Ok(Event::Empty(e)) => {
                if stack.is_empty() && e.local_name().as_ref() == b"Objects" {
                    seen_root = true;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                match stack.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                    ["Objects", "Object"] => object_text.push_str(text.trim()),
                    ["Objects", "Object", "Property"] => properties.push(text.trim().to_string()),
                    [] => return Err(format!("unexpected text outside a document: {}", text.trim())),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("at byte {}: {e}", reader.buffer_position())),
            _ => {}
        }
    }

    if !seen_root {
        return Err("no <Objects> element".into());
    }
    if properties.is_empty() {
        Ok(object_text)
    } else {
        Ok(properties.join("."))
    }
}

/// `winrm get winrm/config -format:xml`. Elements are matched by local name;
/// missing or non-numeric values become 0.
pub fn parse_service_config(xml: &str) -> Result<WinrmConfig, String> {
    let mut reader = new_reader(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut seen_root = false;
    let mut config = WinrmConfig::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if stack.is_empty() {
                    if name != "Config" {
                        return Err(format!("expected <Config>, found <{name}>"));
                    }
                    seen_root = true;
                }
                stack.push(name);
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Empty(e)) => {
                if stack.is_empty() && e.local_name().as_ref() == b"Config" {
                    seen_root = true;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                let value = text.trim().parse::<u64>().unwrap_or(0);
                match stack.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                    ["Config", "MaxEnvelopeSizekb"] => config.max_envelope_size_kb = value,
                    ["Config", "MaxTimeoutms"] => config.max_timeout_ms = value,
                    ["Config", "Service", "MaxConnections"] => config.service.max_connections = value,
                    ["Config", "Service", "MaxConcurrentOperations"] => {
                        config.service.max_concurrent_operations = value
                    }
                    ["Config", "Service", "MaxConcurrentOperationsPerUser"] => {
                        config.service.max_concurrent_operations_per_user = value
                    }
                    ["Config", "Winrs", "MaxMemoryPerShellMB"] => config.winrs.max_memory_per_shell_mb = value,
                    ["Config", "Winrs", "MaxShellsPerUser"] => config.winrs.max_shells_per_user = value,
                    ["Config", "Winrs", "MaxConcurrentUsers"] => config.winrs.max_concurrent_users = value,
                    ["Config", "Winrs", "MaxProcessesPerShell"] => config.winrs.max_processes_per_shell = value,
                    [] => return Err(format!("unexpected text outside a document: {}", text.trim())),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("at byte {}: {e}", reader.buffer_position())),
            _ => {}
        }
    }

    if !seen_root {
        return Err("no <Config> element".into());
    }
    Ok(config)
}
