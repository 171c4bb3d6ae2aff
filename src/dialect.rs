//! Command text for each remote operation, per target shell family.
//!
//! Every string produced here is the exact text handed to
//! [`crate::channel::RemoteShell::run_command`]. Local encoding and the
//! remote decoder (`base64 -d` / `[Convert]::FromBase64String`) agree on
//! standard RFC 4648 base64 with padding.

use crate::protocol::{self, envelope, expansion};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `sh` with GNU coreutils (`base64`, `truncate`, `mv -T`, `find -printf`)
    #[default]
    Posix,
    /// Windows PowerShell, scripts sent as `-EncodedCommand`
    PowerShell,
}

/// The three discovery commands run by the capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    Version,
    ExecutionPolicy,
    ServiceConfig,
}

impl ProbeStep {
    pub const ALL: [ProbeStep; 3] = [Self::Version, Self::ExecutionPolicy, Self::ServiceConfig];

    pub fn name(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::ExecutionPolicy => "execution-policy",
            Self::ServiceConfig => "service-config",
        }
    }
}

impl Dialect {
    /// Envelope growth per raw chunk byte, as (numerator, denominator)
    pub fn expansion(self) -> (usize, usize) {
        match self {
            Self::Posix => expansion::POSIX,
            Self::PowerShell => expansion::POWERSHELL,
        }
    }

    pub fn default_envelope_bytes(self) -> usize {
        match self {
            Self::Posix => envelope::POSIX_DEFAULT,
            Self::PowerShell => envelope::POWERSHELL_DEFAULT,
        }
    }

    pub fn separator(self) -> char {
        match self {
            Self::Posix => '/',
            Self::PowerShell => '\\',
        }
    }

    /// Bring a caller-supplied remote path into the dialect's native form.
    pub fn normalize_path(self, path: &str) -> String {
        match self {
            Self::Posix => path.to_string(),
            Self::PowerShell => path
                .trim()
                .trim_matches(|c| c == '"' || c == '\'')
                .replace('/', "\\"),
        }
    }

    /// Append relative path components to a remote root.
    pub fn join<'a, I>(self, root: &str, components: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let sep = self.separator();
        let mut out = root.trim_end_matches(sep).to_string();
        for part in components {
            if part.is_empty() {
                continue;
            }
            out.push(sep);
            out.push_str(part);
        }
        out
    }

    pub fn staging_path(self, destination: &str, token: &str) -> String {
        format!(
            "{destination}{}{token}{}",
            protocol::STAGING_MARKER,
            protocol::STAGING_EXTENSION
        )
    }

    /// Truncate the staging file to `offset`, then append the decoded chunk.
    pub fn append_command(self, staging: &str, offset: u64, encoded: &str, create_parent: bool) -> String {
        match self {
            Self::Posix => {
                let mut cmd = String::with_capacity(encoded.len() + 2 * staging.len() + 96);
                if create_parent {
                    if let Some(parent) = posix_parent(staging) {
                        cmd.push_str(&format!("mkdir -p {} && ", sh_quote(parent)));
                    }
                }
                let tmp = sh_quote(staging);
                cmd.push_str(&format!(
                    "truncate -s {offset} {tmp} && printf %s '{encoded}' | base64 -d >> {tmp}"
                ));
                cmd
            }
            Self::PowerShell => {
                let mut script = format!("$ErrorActionPreference='Stop';$p={};", ps_quote(staging));
                if create_parent {
                    script.push_str(PS_ENSURE_PARENT);
                }
                script.push_str(&format!(
                    "$b=[Convert]::FromBase64String('{encoded}');\
                     $f=[IO.File]::Open($p,[IO.FileMode]::OpenOrCreate,[IO.FileAccess]::Write);\
                     try{{$f.SetLength({offset});[void]$f.Seek({offset},[IO.SeekOrigin]::Begin);$f.Write($b,0,$b.Length)}}\
                     finally{{$f.Close()}}"
                ));
                encode_powershell(&script)
            }
        }
    }

    /// Rename the staging file onto the destination. With `create_empty` the
    /// staging file (and the destination's parent) is created first.
    pub fn finalize_command(self, staging: &str, destination: &str, create_empty: bool) -> String {
        match self {
            Self::Posix => {
                let tmp = sh_quote(staging);
                let mut cmd = String::new();
                if create_empty {
                    if let Some(parent) = posix_parent(staging) {
                        cmd.push_str(&format!("mkdir -p {} && ", sh_quote(parent)));
                    }
                    cmd.push_str(&format!(": > {tmp} && "));
                }
                // -T: never move *into* a directory that happens to sit at the destination
                cmd.push_str(&format!("mv -f -T {tmp} {}", sh_quote(destination)));
                cmd
            }
            Self::PowerShell => {
                let mut script = format!(
                    "$ErrorActionPreference='Stop';$p={};$d={};",
                    ps_quote(staging),
                    ps_quote(destination)
                );
                if create_empty {
                    script.push_str(PS_ENSURE_PARENT);
                    script.push_str("[IO.File]::WriteAllBytes($p,[byte[]]@());");
                }
                script.push_str(
                    "if(Test-Path -LiteralPath $d -PathType Container){exit 1};\
                     if(Test-Path -LiteralPath $d){[IO.File]::Replace($p,$d,$null)}else{[IO.File]::Move($p,$d)}",
                );
                encode_powershell(&script)
            }
        }
    }

    /// Rerun of a finalize whose outcome is unknown. A missing staging file
    /// next to a regular file at the destination means the earlier rename
    /// went through.
    pub fn finalize_retry_command(self, staging: &str, destination: &str) -> String {
        match self {
            Self::Posix => {
                let tmp = sh_quote(staging);
                let dst = sh_quote(destination);
                format!("if [ -e {tmp} ] ; then mv -f -T {tmp} {dst} ; else test -f {dst} ; fi")
            }
            Self::PowerShell => {
                let script = format!(
                    "$ErrorActionPreference='Stop';$p={};$d={};\
                     if(-not(Test-Path -LiteralPath $p)){{if(Test-Path -LiteralPath $d -PathType Leaf){{exit 0}};exit 1}};\
                     if(Test-Path -LiteralPath $d -PathType Container){{exit 1}};\
                     if(Test-Path -LiteralPath $d){{[IO.File]::Replace($p,$d,$null)}}else{{[IO.File]::Move($p,$d)}}",
                    ps_quote(staging),
                    ps_quote(destination)
                );
                encode_powershell(&script)
            }
        }
    }

    /// One record per entry: `<kind>\t<size>\t<mtime>\t<name>`. Posix
    /// records end in NUL since names may contain newlines; PowerShell
    /// records end in a newline.
    pub fn list_command(self, path: &str) -> String {
        match self {
            Self::Posix => format!(
                "find {} -mindepth 1 -maxdepth 1 -printf '%y\\t%s\\t%T@\\t%f\\0'",
                sh_quote(path)
            ),
            Self::PowerShell => {
                let script = format!(
                    "$ErrorActionPreference='Stop';Get-ChildItem -LiteralPath {} -Force|ForEach-Object{{\
                     $k=if($_.PSIsContainer){{'d'}}else{{'f'}};\
                     $s=if($_.PSIsContainer){{0}}else{{$_.Length}};\
                     \"{{0}}`t{{1}}`t{{2}}`t{{3}}\" -f $k,$s,([DateTimeOffset]$_.LastWriteTimeUtc).ToUnixTimeSeconds(),$_.Name}}",
                    ps_quote(path)
                );
                encode_powershell(&script)
            }
        }
    }

    /// `None` when the dialect has no equivalent for the step.
    pub fn probe_command(self, step: ProbeStep) -> Option<String> {
        match (self, step) {
            (Self::Posix, ProbeStep::Version) => Some(
                "printf '<Objects><Object>%s</Object></Objects>' \"$(uname -sr)\"".to_string(),
            ),
            (Self::Posix, ProbeStep::ExecutionPolicy) => None,
            (Self::Posix, ProbeStep::ServiceConfig) => Some(format!(
                "printf '<Config><MaxEnvelopeSizekb>{}</MaxEnvelopeSizekb>\
                 <Winrs><MaxProcessesPerShell>%s</MaxProcessesPerShell></Winrs></Config>' \
                 \"$(getconf CHILD_MAX)\"",
                envelope::POSIX_DEFAULT / 1024
            )),
            (Self::PowerShell, ProbeStep::Version) => Some(encode_powershell(
                "$PSVersionTable.PSVersion | ConvertTo-Xml -NoTypeInformation -As String",
            )),
            (Self::PowerShell, ProbeStep::ExecutionPolicy) => {
                Some(encode_powershell("(Get-ExecutionPolicy).ToString()"))
            }
            (Self::PowerShell, ProbeStep::ServiceConfig) => {
                Some("winrm get winrm/config -format:xml".to_string())
            }
        }
    }
}

const PS_ENSURE_PARENT: &str = "$dir=[IO.Path]::GetDirectoryName($p);\
    if($dir -and -not(Test-Path -LiteralPath $dir)){New-Item -ItemType Directory -Force -Path $dir|Out-Null};";

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Posix => "posix",
            Self::PowerShell => "powershell",
        })
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "posix" | "sh" => Ok(Self::Posix),
            "powershell" | "ps" | "pwsh" => Ok(Self::PowerShell),
            other => Err(format!("unknown dialect `{other}` (expected posix or powershell)")),
        }
    }
}

/// Single-quote for `sh`; embedded quotes become `'\''`.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Single-quote for PowerShell; every quote-like character is doubled.
pub fn ps_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// `powershell -EncodedCommand` wants the script as UTF-16LE, base64 encoded
fn encode_powershell(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    format!(
        "powershell -NoProfile -NonInteractive -EncodedCommand {}",
        STANDARD.encode(utf16)
    )
}

fn posix_parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}
