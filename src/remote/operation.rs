//! Typed remote operations.
//!
//! Feature panels describe what they want done as an [`OperationKind`]
//! (kind + structured parameters). The kind renders to a PowerShell script in
//! which every parameter is a single-quoted literal, and the script travels as
//! `powershell.exe -EncodedCommand <base64 UTF-16LE>`. No parameter is ever
//! spliced into a shell command line, so values cannot inject commands.
//!
//! The remote response is interpreted by [`interpret_output`]: a non-zero
//! exit status becomes [`RemoteError::RemoteExec`] with the remote text kept
//! verbatim.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::error::RemoteError;
use super::transport::ExecOutput;

/// Longest encoded command accepted (Windows caps command lines at 32767 chars).
const MAX_ENCODED_COMMAND_LEN: usize = 30_000;

/// Registry hives accepted in keys, with their provider names.
const HIVES: &[(&str, &str)] = &[
    ("HKLM", "HKEY_LOCAL_MACHINE"),
    ("HKEY_LOCAL_MACHINE", "HKEY_LOCAL_MACHINE"),
    ("HKCU", "HKEY_CURRENT_USER"),
    ("HKEY_CURRENT_USER", "HKEY_CURRENT_USER"),
    ("HKU", "HKEY_USERS"),
    ("HKEY_USERS", "HKEY_USERS"),
    ("HKCR", "HKEY_CLASSES_ROOT"),
    ("HKEY_CLASSES_ROOT", "HKEY_CLASSES_ROOT"),
    ("HKCC", "HKEY_CURRENT_CONFIG"),
    ("HKEY_CURRENT_CONFIG", "HKEY_CURRENT_CONFIG"),
];

/// Environment variable scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnvScope {
    /// The account the session logged in as
    User,
    /// System-wide (needs administrative rights)
    Machine,
}

impl EnvScope {
    fn target(self) -> &'static str {
        match self {
            EnvScope::User => "User",
            EnvScope::Machine => "Machine",
        }
    }
}

/// Registry value with its type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RegistryValue {
    String(String),
    ExpandString(String),
    Dword(u32),
    Qword(u64),
    MultiString(Vec<String>),
}

impl RegistryValue {
    fn property_type(&self) -> &'static str {
        match self {
            RegistryValue::String(_) => "String",
            RegistryValue::ExpandString(_) => "ExpandString",
            RegistryValue::Dword(_) => "DWord",
            RegistryValue::Qword(_) => "QWord",
            RegistryValue::MultiString(_) => "MultiString",
        }
    }

    fn literal(&self) -> String {
        match self {
            RegistryValue::String(s) | RegistryValue::ExpandString(s) => ps_quote(s),
            RegistryValue::Dword(n) => format!("([uint32]{})", n),
            RegistryValue::Qword(n) => format!("([uint64]{})", n),
            RegistryValue::MultiString(items) => {
                let quoted: Vec<String> = items.iter().map(|s| ps_quote(s)).collect();
                format!("@({})", quoted.join(", "))
            }
        }
    }

    fn strings(&self) -> Vec<&str> {
        match self {
            RegistryValue::String(s) | RegistryValue::ExpandString(s) => vec![s.as_str()],
            RegistryValue::MultiString(items) => items.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessTarget {
    Pid(u32),
    Name(String),
}

/// One remote configuration action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    SetEnvironmentVariable {
        name: String,
        value: String,
        scope: EnvScope,
    },
    DeleteEnvironmentVariable {
        name: String,
        scope: EnvScope,
    },
    ListEnvironmentVariables {
        scope: EnvScope,
    },
    SetRegistryValue {
        key: String,
        name: String,
        value: RegistryValue,
    },
    DeleteRegistryValue {
        key: String,
        name: String,
    },
    ControlService {
        name: String,
        action: ServiceAction,
    },
    StopProcess {
        target: ProcessTarget,
    },
}

impl OperationKind {
    /// Parse an operation from its JSON form.
    ///
    /// Unknown kinds and missing or mistyped parameters are `InvalidRequest`.
    pub fn from_value(value: serde_json::Value) -> Result<Self, RemoteError> {
        let operation: OperationKind = serde_json::from_value(value)
            .map_err(|e| RemoteError::InvalidRequest(format!("malformed operation: {}", e)))?;
        operation.validate()?;
        Ok(operation)
    }

    /// Short label for logs and reports.
    pub fn label(&self) -> String {
        match self {
            OperationKind::SetEnvironmentVariable { name, scope, .. } => {
                format!("set {} variable {}", scope.target().to_lowercase(), name)
            }
            OperationKind::DeleteEnvironmentVariable { name, scope } => {
                format!("delete {} variable {}", scope.target().to_lowercase(), name)
            }
            OperationKind::ListEnvironmentVariables { scope } => {
                format!("list {} variables", scope.target().to_lowercase())
            }
            OperationKind::SetRegistryValue { key, name, .. } => {
                format!("set registry value {}\\{}", key, name)
            }
            OperationKind::DeleteRegistryValue { key, name } => {
                format!("delete registry value {}\\{}", key, name)
            }
            OperationKind::ControlService { name, action } => {
                format!("{:?} service {}", action, name).to_lowercase()
            }
            OperationKind::StopProcess { target } => match target {
                ProcessTarget::Pid(pid) => format!("stop process {}", pid),
                ProcessTarget::Name(name) => format!("stop process {}", name),
            },
        }
    }

    /// Check parameters before anything is dispatched.
    pub fn validate(&self) -> Result<(), RemoteError> {
        match self {
            OperationKind::SetEnvironmentVariable { name, value, .. } => {
                validate_variable_name(name)?;
                reject_nul("variable value", value)
            }
            OperationKind::DeleteEnvironmentVariable { name, .. } => validate_variable_name(name),
            OperationKind::ListEnvironmentVariables { .. } => Ok(()),
            OperationKind::SetRegistryValue { key, name, value } => {
                registry_provider_path(key)?;
                require_text("registry value name", name)?;
                for s in value.strings() {
                    reject_nul("registry data", s)?;
                }
                Ok(())
            }
            OperationKind::DeleteRegistryValue { key, name } => {
                registry_provider_path(key)?;
                require_text("registry value name", name)
            }
            OperationKind::ControlService { name, .. } => require_text("service name", name),
            OperationKind::StopProcess { target } => match target {
                ProcessTarget::Pid(0) => Err(RemoteError::InvalidRequest(
                    "process id must be positive".to_string(),
                )),
                ProcessTarget::Pid(_) => Ok(()),
                ProcessTarget::Name(name) => require_text("process name", name),
            },
        }
    }

    /// The PowerShell body for this operation.
    pub fn script(&self) -> Result<String, RemoteError> {
        let body = match self {
            OperationKind::SetEnvironmentVariable { name, value, scope } => format!(
                "[Environment]::SetEnvironmentVariable({}, {}, '{}')",
                ps_quote(name),
                ps_quote(value),
                scope.target()
            ),
            OperationKind::DeleteEnvironmentVariable { name, scope } => format!(
                "[Environment]::SetEnvironmentVariable({}, $null, '{}')",
                ps_quote(name),
                scope.target()
            ),
            OperationKind::ListEnvironmentVariables { scope } => format!(
                "$vars = [Environment]::GetEnvironmentVariables('{}')\n\
                 foreach ($k in ($vars.Keys | Sort-Object)) {{ Write-Output ('{{0}}={{1}}' -f $k, $vars[$k]) }}",
                scope.target()
            ),
            OperationKind::SetRegistryValue { key, name, value } => {
                let path = registry_provider_path(key)?;
                format!(
                    "$path = {}\n\
                     if (-not (Test-Path -LiteralPath $path)) {{ New-Item -Path $path -Force | Out-Null }}\n\
                     New-ItemProperty -LiteralPath $path -Name {} -Value {} -PropertyType {} -Force | Out-Null",
                    ps_quote(&path),
                    ps_quote(name),
                    value.literal(),
                    value.property_type()
                )
            }
            OperationKind::DeleteRegistryValue { key, name } => {
                let path = registry_provider_path(key)?;
                format!(
                    "Remove-ItemProperty -LiteralPath {} -Name {}",
                    ps_quote(&path),
                    ps_quote(name)
                )
            }
            OperationKind::ControlService { name, action } => match action {
                ServiceAction::Start => format!("Start-Service -Name {}", ps_quote(name)),
                ServiceAction::Stop => format!("Stop-Service -Name {} -Force", ps_quote(name)),
                ServiceAction::Restart => {
                    format!("Restart-Service -Name {} -Force", ps_quote(name))
                }
            },
            OperationKind::StopProcess { target } => match target {
                ProcessTarget::Pid(pid) => format!("Stop-Process -Id {} -Force", pid),
                ProcessTarget::Name(name) => {
                    format!("Stop-Process -Name {} -Force", ps_quote(name))
                }
            },
        };

        Ok(format!(
            "$ErrorActionPreference = 'Stop'\n\
             $ProgressPreference = 'SilentlyContinue'\n\
             try {{\n{}\n}} catch {{\n[Console]::Error.WriteLine($_.Exception.Message)\nexit 1\n}}\n",
            body
        ))
    }

    /// The full command line sent over the exec channel.
    pub fn command_line(&self) -> Result<String, RemoteError> {
        let encoded = encode_command(&self.script()?);
        if encoded.len() > MAX_ENCODED_COMMAND_LEN {
            return Err(RemoteError::InvalidRequest(format!(
                "{}: parameters too large ({} encoded bytes)",
                self.label(),
                encoded.len()
            )));
        }
        Ok(format!(
            "powershell.exe -NoProfile -NonInteractive -EncodedCommand {}",
            encoded
        ))
    }
}

/// Result of a successful remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OperationOutcome {
    /// Trimmed standard output
    pub output: String,
}

impl OperationOutcome {
    /// `NAME=VALUE` lines split into pairs (for variable listings).
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.output
            .lines()
            .filter_map(|line| line.split_once('='))
            .collect()
    }
}

/// Classify the output of a remote command.
pub fn interpret_output(host: &str, output: ExecOutput) -> Result<OperationOutcome, RemoteError> {
    if output.exit_code == 0 {
        return Ok(OperationOutcome {
            output: output.stdout.trim().to_string(),
        });
    }

    let message = [output.stderr.trim(), output.stdout.trim()]
        .into_iter()
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("remote command exited with status {}", output.exit_code));

    Err(RemoteError::RemoteExec {
        host: host.to_string(),
        exit_code: output.exit_code,
        message,
    })
}

/// Quote a string as a PowerShell single-quoted literal.
///
/// Inside single quotes only `'` is special, and it is escaped by doubling.
/// PowerShell also treats the typographic quotes U+2018..U+201B as single
/// quotes, so those are doubled too.
pub(crate) fn ps_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            quoted.push(c);
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Base64 of the UTF-16LE script, as `-EncodedCommand` expects.
pub(crate) fn encode_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

/// Map `HKLM\Software\Foo` (or `HKLM:\Software\Foo`) to a provider path.
fn registry_provider_path(key: &str) -> Result<String, RemoteError> {
    let invalid = || RemoteError::InvalidRequest(format!("registry key '{}' must start with a hive", key));

    reject_nul("registry key", key)?;
    let (hive, rest) = key.split_once('\\').ok_or_else(invalid)?;
    let hive = hive.trim_end_matches(':');
    let provider = HIVES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(hive))
        .map(|(_, full)| *full)
        .ok_or_else(invalid)?;

    let rest = rest.trim_matches('\\');
    if rest.is_empty() {
        return Err(RemoteError::InvalidRequest(format!(
            "registry key '{}' names a hive root",
            key
        )));
    }
    Ok(format!("Registry::{}\\{}", provider, rest))
}

fn validate_variable_name(name: &str) -> Result<(), RemoteError> {
    require_text("variable name", name)?;
    if name.contains('=') {
        return Err(RemoteError::InvalidRequest(format!(
            "variable name '{}' must not contain '='",
            name
        )));
    }
    Ok(())
}

fn require_text(what: &str, value: &str) -> Result<(), RemoteError> {
    if value.trim().is_empty() {
        return Err(RemoteError::InvalidRequest(format!("{} must not be empty", what)));
    }
    reject_nul(what, value)
}

fn reject_nul(what: &str, value: &str) -> Result<(), RemoteError> {
    if value.contains('\0') {
        return Err(RemoteError::InvalidRequest(format!("{} contains a NUL character", what)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(command_line: &str) -> String {
        let encoded = command_line.rsplit(' ').next().unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).unwrap()
    }

    mod quoting {
        use super::*;

        #[test]
        fn test_plain_value() {
            assert_eq!(ps_quote("C:\\Tools"), "'C:\\Tools'");
        }

        #[test]
        fn test_single_quote_is_doubled() {
            assert_eq!(ps_quote("it's"), "'it''s'");
        }

        #[test]
        fn test_smart_quote_is_doubled() {
            assert_eq!(ps_quote("a\u{2019}b"), "'a\u{2019}\u{2019}b'");
        }

        #[test]
        fn test_injection_attempt_stays_literal() {
            let quoted = ps_quote("x'; Remove-Item C:\\ -Recurse; '");
            assert_eq!(quoted, "'x''; Remove-Item C:\\ -Recurse; '''");
        }

        #[test]
        fn test_dollar_is_not_expanded() {
            assert_eq!(ps_quote("$env:PATH"), "'$env:PATH'");
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn test_set_variable_from_json() {
            let op = OperationKind::from_value(json!({
                "kind": "set_environment_variable",
                "name": "VAR",
                "value": "1",
                "scope": "machine"
            }))
            .unwrap();
            assert_eq!(
                op,
                OperationKind::SetEnvironmentVariable {
                    name: "VAR".into(),
                    value: "1".into(),
                    scope: EnvScope::Machine
                }
            );
        }

        #[test]
        fn test_unknown_kind_is_invalid_request() {
            let err = OperationKind::from_value(json!({"kind": "format_disk", "drive": "C"}))
                .unwrap_err();
            assert!(matches!(err, RemoteError::InvalidRequest(_)));
        }

        #[test]
        fn test_missing_parameter_is_invalid_request() {
            let err = OperationKind::from_value(json!({"kind": "control_service", "name": "Spooler"}))
                .unwrap_err();
            assert!(matches!(err, RemoteError::InvalidRequest(_)));
        }

        #[test]
        fn test_registry_value_shape() {
            let op = OperationKind::from_value(json!({
                "kind": "set_registry_value",
                "key": "HKLM\\SOFTWARE\\Contoso",
                "name": "Level",
                "value": {"type": "dword", "data": 3}
            }))
            .unwrap();
            assert!(matches!(
                op,
                OperationKind::SetRegistryValue { value: RegistryValue::Dword(3), .. }
            ));
        }

        #[test]
        fn test_process_target_shape() {
            let op = OperationKind::from_value(json!({
                "kind": "stop_process",
                "target": {"name": "notepad"}
            }))
            .unwrap();
            assert_eq!(
                op,
                OperationKind::StopProcess {
                    target: ProcessTarget::Name("notepad".into())
                }
            );
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn test_empty_variable_name() {
            let op = OperationKind::DeleteEnvironmentVariable {
                name: " ".into(),
                scope: EnvScope::User,
            };
            assert!(op.validate().is_err());
        }

        #[test]
        fn test_variable_name_with_equals() {
            let op = OperationKind::SetEnvironmentVariable {
                name: "A=B".into(),
                value: "1".into(),
                scope: EnvScope::User,
            };
            assert!(op.validate().is_err());
        }

        #[test]
        fn test_nul_in_value() {
            let op = OperationKind::SetEnvironmentVariable {
                name: "A".into(),
                value: "x\0y".into(),
                scope: EnvScope::User,
            };
            assert!(op.validate().is_err());
        }

        #[test]
        fn test_registry_key_needs_known_hive() {
            assert!(registry_provider_path("HKXX\\Software").is_err());
            assert!(registry_provider_path("Software\\Contoso").is_err());
            assert!(registry_provider_path("HKLM\\").is_err());
        }

        #[test]
        fn test_registry_key_aliases() {
            assert_eq!(
                registry_provider_path("hklm:\\SOFTWARE\\Contoso").unwrap(),
                "Registry::HKEY_LOCAL_MACHINE\\SOFTWARE\\Contoso"
            );
            assert_eq!(
                registry_provider_path("HKEY_CURRENT_USER\\Environment").unwrap(),
                "Registry::HKEY_CURRENT_USER\\Environment"
            );
        }

        #[test]
        fn test_pid_zero() {
            let op = OperationKind::StopProcess {
                target: ProcessTarget::Pid(0),
            };
            assert!(op.validate().is_err());
        }
    }

    mod rendering {
        use super::*;

        #[test]
        fn test_command_line_shape() {
            let op = OperationKind::SetEnvironmentVariable {
                name: "VAR".into(),
                value: "1".into(),
                scope: EnvScope::Machine,
            };
            let line = op.command_line().unwrap();
            assert!(line.starts_with("powershell.exe -NoProfile -NonInteractive -EncodedCommand "));
            assert!(!line.contains("VAR"));
        }

        #[test]
        fn test_encoded_script_roundtrips() {
            let op = OperationKind::SetEnvironmentVariable {
                name: "VAR".into(),
                value: "it's 1".into(),
                scope: EnvScope::Machine,
            };
            let script = decode(&op.command_line().unwrap());
            assert!(script.contains(
                "[Environment]::SetEnvironmentVariable('VAR', 'it''s 1', 'Machine')"
            ));
            assert!(script.starts_with("$ErrorActionPreference = 'Stop'"));
        }

        #[test]
        fn test_delete_variable_uses_null() {
            let op = OperationKind::DeleteEnvironmentVariable {
                name: "OLD".into(),
                scope: EnvScope::User,
            };
            assert!(op
                .script()
                .unwrap()
                .contains("SetEnvironmentVariable('OLD', $null, 'User')"));
        }

        #[test]
        fn test_registry_multistring_literal() {
            let op = OperationKind::SetRegistryValue {
                key: "HKLM\\SOFTWARE\\Contoso".into(),
                name: "Servers".into(),
                value: RegistryValue::MultiString(vec!["a".into(), "b'c".into()]),
            };
            let script = op.script().unwrap();
            assert!(script.contains("-Value @('a', 'b''c') -PropertyType MultiString"));
            assert!(script.contains("'Registry::HKEY_LOCAL_MACHINE\\SOFTWARE\\Contoso'"));
        }

        #[test]
        fn test_service_restart() {
            let op = OperationKind::ControlService {
                name: "Spooler".into(),
                action: ServiceAction::Restart,
            };
            assert!(op.script().unwrap().contains("Restart-Service -Name 'Spooler' -Force"));
            assert_eq!(op.label(), "restart service spooler");
        }

        #[test]
        fn test_oversized_parameters_rejected() {
            let op = OperationKind::SetEnvironmentVariable {
                name: "BIG".into(),
                value: "x".repeat(20_000),
                scope: EnvScope::User,
            };
            assert!(matches!(op.command_line(), Err(RemoteError::InvalidRequest(_))));
        }
    }

    mod interpretation {
        use super::*;

        #[test]
        fn test_success_trims_output() {
            let outcome = interpret_output(
                "A",
                ExecOutput {
                    stdout: "PATH=C:\\Windows\r\nVAR=1\r\n".into(),
                    stderr: String::new(),
                    exit_code: 0,
                },
            )
            .unwrap();
            assert_eq!(outcome.pairs(), vec![("PATH", "C:\\Windows"), ("VAR", "1")]);
        }

        #[test]
        fn test_failure_preserves_stderr() {
            let err = interpret_output(
                "A",
                ExecOutput {
                    stdout: String::new(),
                    stderr: "Requested registry access is not allowed.\r\n".into(),
                    exit_code: 1,
                },
            )
            .unwrap_err();
            assert_eq!(
                err,
                RemoteError::RemoteExec {
                    host: "A".into(),
                    exit_code: 1,
                    message: "Requested registry access is not allowed.".into()
                }
            );
        }

        #[test]
        fn test_failure_falls_back_to_stdout_then_status() {
            let err = interpret_output(
                "A",
                ExecOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 3,
                },
            )
            .unwrap_err();
            assert!(err.to_string().contains("exited with status 3"));
        }
    }
}
