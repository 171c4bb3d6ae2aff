//! In-memory remote host that understands the posix command dialect.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use shellcp::{ChannelError, CommandOutput, RemoteHost, RemoteShell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Which commands a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Append,
    Finalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Channel reports a transient error, nothing applied
    Transient,
    /// Command applied, response lost
    LostResponse,
    /// Never answers
    Stall,
    /// Command exits with this status
    Exit(i32),
    Refused,
    Connection,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: Vec<String>,
    /// (staging path, offset, decoded length) per applied append
    appends: Vec<(String, u64, usize)>,
    attempts: HashMap<String, u32>,
    faults: Vec<(Target, Fault, u32)>,
    responses: Vec<(String, CommandOutput)>,
    delays: Vec<Duration>,
    open_shells: usize,
    peak_shells: usize,
    stall_connect: bool,
    refuse_connect: bool,
}

#[derive(Clone, Default)]
pub struct MemoryHost {
    state: Arc<Mutex<State>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        let host = Self::default();
        host.state.lock().dirs.insert("/".into());
        host
    }

    /// The first `times` attempts of every matching command hit `fault`.
    pub fn fail(self, target: Target, fault: Fault, times: u32) -> Self {
        self.state.lock().faults.push((target, fault, times));
        self
    }

    /// Canned answer for commands starting with `prefix`.
    pub fn respond(self, prefix: &str, stdout: &str) -> Self {
        self.respond_with(
            prefix,
            CommandOutput {
                stdout: stdout.into(),
                ..Default::default()
            },
        )
    }

    pub fn respond_with(self, prefix: &str, output: CommandOutput) -> Self {
        self.state.lock().responses.push((prefix.into(), output));
        self
    }

    /// Advertise an envelope budget through the service-config probe.
    pub fn envelope_kb(self, kb: u64) -> Self {
        self.respond(
            "printf '<Config>",
            &format!("<Config><MaxEnvelopeSizekb>{kb}</MaxEnvelopeSizekb></Config>"),
        )
    }

    /// Per-command response delays, cycled.
    pub fn delays(self, delays: Vec<Duration>) -> Self {
        self.state.lock().delays = delays;
        self
    }

    pub fn stall_connect(self) -> Self {
        self.state.lock().stall_connect = true;
        self
    }

    pub fn refuse_connect(self) -> Self {
        self.state.lock().refuse_connect = true;
        self
    }

    pub fn mkdir(&self, path: &str) {
        mkdir_p(&mut self.state.lock().dirs, path);
    }

    pub fn put(&self, path: &str, bytes: &[u8]) {
        self.state.lock().files.insert(path.into(), bytes.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().files.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn appends(&self) -> Vec<(String, u64, usize)> {
        self.state.lock().appends.clone()
    }

    pub fn peak_shells(&self) -> usize {
        self.state.lock().peak_shells
    }

    pub fn open_shells(&self) -> usize {
        self.state.lock().open_shells
    }

    /// Paths left by unfinished transfers
    pub fn staging_files(&self) -> Vec<String> {
        self.state
            .lock()
            .files
            .keys()
            .filter(|p| p.contains(".shellcp-") && p.ends_with(".part"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RemoteHost for MemoryHost {
    async fn open_shell(&self) -> Result<Box<dyn RemoteShell>, ChannelError> {
        let (stall, refuse) = {
            let s = self.state.lock();
            (s.stall_connect, s.refuse_connect)
        };
        if refuse {
            return Err(ChannelError::Connection("connection refused".into()));
        }
        if stall {
            std::future::pending::<()>().await;
        }
        let mut s = self.state.lock();
        s.open_shells += 1;
        s.peak_shells = s.peak_shells.max(s.open_shells);
        Ok(Box::new(MemoryShell {
            state: self.state.clone(),
        }))
    }
}

struct MemoryShell {
    state: Arc<Mutex<State>>,
}

impl Drop for MemoryShell {
    fn drop(&mut self) {
        self.state.lock().open_shells -= 1;
    }
}

#[async_trait]
impl RemoteShell for MemoryShell {
    async fn run_command(&mut self, command: &str) -> Result<CommandOutput, ChannelError> {
        let (delay, fault) = {
            let mut s = self.state.lock();
            let n = s.commands.len();
            s.commands.push(command.to_string());
            let delay = if s.delays.is_empty() {
                Duration::ZERO
            } else {
                s.delays[n % s.delays.len()]
            };
            let target = if command.contains("| base64 -d >>") {
                Some(Target::Append)
            } else if command.contains("mv -f -T") {
                Some(Target::Finalize)
            } else {
                None
            };
            // a finalize and its rerun count as attempts of the same rename
            let key = match target {
                Some(Target::Finalize) => split_words(command)
                    .into_iter()
                    .find(|w| w.contains(".shellcp-"))
                    .unwrap_or_else(|| command.to_string()),
                _ => command.to_string(),
            };
            let attempt = {
                let a = s.attempts.entry(key).or_insert(0);
                *a += 1;
                *a
            };
            let fault = target.and_then(|t| {
                s.faults
                    .iter()
                    .find(|(ft, _, times)| *ft == t && attempt <= *times)
                    .map(|(_, f, _)| *f)
            });
            (delay, fault)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match fault {
            Some(Fault::Transient) => return Err(ChannelError::Transient("server busy".into())),
            Some(Fault::Stall) => {
                std::future::pending::<()>().await;
            }
            Some(Fault::Exit(code)) => {
                return Ok(CommandOutput {
                    stderr: "injected failure".into(),
                    exit_code: code,
                    ..Default::default()
                })
            }
            Some(Fault::Refused) => return Err(ChannelError::Refused("access denied".into())),
            Some(Fault::Connection) => return Err(ChannelError::Connection("reset by peer".into())),
            Some(Fault::LostResponse) => {
                self.state.lock().execute(command);
                return Err(ChannelError::Transient("response lost".into()));
            }
            None => {}
        }

        let mut s = self.state.lock();
        if let Some((_, out)) = s.responses.iter().find(|(p, _)| command.starts_with(p.as_str())) {
            return Ok(out.clone());
        }
        Ok(s.execute(command))
    }
}

impl State {
    /// Run a `&&` chain; stops at the first failing segment.
    fn execute(&mut self, command: &str) -> CommandOutput {
        if let Some(result) = self.conditional(command) {
            return match result {
                Ok(()) => CommandOutput::default(),
                Err(msg) => CommandOutput {
                    stdout: String::new(),
                    stderr: msg,
                    exit_code: 1,
                },
            };
        }
        for segment in command.split(" && ") {
            let words = split_words(segment);
            if let Err(msg) = self.run_segment(&words) {
                return CommandOutput {
                    stdout: String::new(),
                    stderr: msg,
                    exit_code: 1,
                };
            }
        }
        let stdout = match split_words(command).as_slice() {
            [find, path, ..] if find == "find" => self.listing(path),
            _ => String::new(),
        };
        CommandOutput {
            stdout,
            ..Default::default()
        }
    }

    /// `if [ -e A ] ; then <cmd> ; else test -f B ; fi`
    fn conditional(&mut self, command: &str) -> Option<Result<(), String>> {
        let words = split_words(command);
        let w: Vec<&str> = words.iter().map(String::as_str).collect();
        let ["if", "[", "-e", probe, "]", ";", "then", rest @ ..] = w.as_slice() else {
            return None;
        };
        let split = rest.iter().position(|w| *w == ";")?;
        let (then, tail) = rest.split_at(split);
        let ["else", "test", "-f", file, ";", "fi"] = &tail[1..] else {
            return None;
        };
        let then: Vec<String> = then.iter().map(|w| w.to_string()).collect();
        Some(if self.files.contains_key(*probe) {
            self.run_segment(&then)
        } else if self.files.contains_key(*file) {
            Ok(())
        } else {
            Err(String::new())
        })
    }

    fn run_segment(&mut self, words: &[String]) -> Result<(), String> {
        let w: Vec<&str> = words.iter().map(String::as_str).collect();
        match w.as_slice() {
            ["mkdir", "-p", path] => {
                mkdir_p(&mut self.dirs, path);
                Ok(())
            }
            ["truncate", "-s", size, path] => {
                let size: usize = size.parse().map_err(|_| format!("bad size {size}"))?;
                self.require_parent(path)?;
                self.files.entry(path.to_string()).or_default().resize(size, 0);
                Ok(())
            }
            ["printf", "%s", b64, "|", "base64", "-d", ">>", path] => {
                self.require_parent(path)?;
                let bytes = STANDARD.decode(b64).map_err(|e| format!("base64: invalid input: {e}"))?;
                let file = self.files.entry(path.to_string()).or_default();
                let offset = file.len() as u64;
                file.extend_from_slice(&bytes);
                self.appends.push((path.to_string(), offset, bytes.len()));
                Ok(())
            }
            [":", ">", path] => {
                self.require_parent(path)?;
                self.files.insert(path.to_string(), Vec::new());
                Ok(())
            }
            ["mv", "-f", "-T", from, to] => {
                if self.dirs.contains(*to) {
                    return Err(format!("mv: cannot overwrite directory '{to}'"));
                }
                let bytes = self
                    .files
                    .remove(*from)
                    .ok_or_else(|| format!("mv: cannot stat '{from}'"))?;
                self.files.insert(to.to_string(), bytes);
                Ok(())
            }
            ["find", path, ..] => {
                if self.dirs.contains(*path) {
                    Ok(())
                } else {
                    Err(format!("find: '{path}': No such file or directory"))
                }
            }
            other => Err(format!("sh: {}: command not found", other.first().unwrap_or(&""))),
        }
    }

    fn require_parent(&self, path: &str) -> Result<(), String> {
        let parent = parent_of(path);
        if self.dirs.contains(parent) {
            Ok(())
        } else {
            Err(format!("{path}: No such file or directory"))
        }
    }

    fn listing(&self, dir: &str) -> String {
        let mut out = String::new();
        for d in self.dirs.iter().filter(|d| d.as_str() != dir && parent_of(d) == dir) {
            out.push_str(&format!("d\t4096\t1700000000.0000000000\t{}\0", base_of(d)));
        }
        for (f, bytes) in self.files.iter().filter(|(f, _)| parent_of(f) == dir) {
            out.push_str(&format!(
                "f\t{}\t1700000000.0000000000\t{}\0",
                bytes.len(),
                base_of(f)
            ));
        }
        out
    }
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}

fn base_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn mkdir_p(dirs: &mut BTreeSet<String>, path: &str) {
    let mut current = path.trim_end_matches('/').to_string();
    while !current.is_empty() && current != "/" && current != "." {
        let parent = parent_of(&current).to_string();
        dirs.insert(current);
        current = parent;
    }
}

/// `sh` word splitting for the subset the posix dialect emits: single
/// quotes, backslash escapes and blanks.
pub fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    cur.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(n) = chars.next() {
                    cur.push(n);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                cur.push(c);
            }
        }
    }
    if in_word {
        words.push(cur);
    }
    words
}
