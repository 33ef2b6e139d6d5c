//! Agent flag files and quick install/removal scripts

use crate::constants::DEFAULT_CARVER_BLOCK_SIZE;
use crate::types::{Environment, ScriptPurpose};

/// Quick scripts served from the secret-path endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickScript {
    EnrollShell,
    EnrollPowershell,
    RemoveShell,
    RemovePowershell,
    Flags,
    Certificate,
}

impl QuickScript {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "enroll.sh" => Some(Self::EnrollShell),
            "enroll.ps1" => Some(Self::EnrollPowershell),
            "remove.sh" => Some(Self::RemoveShell),
            "remove.ps1" => Some(Self::RemovePowershell),
            "flags" => Some(Self::Flags),
            "cert" => Some(Self::Certificate),
            _ => None,
        }
    }

    /// Which secret path gates this script
    pub fn purpose(&self) -> ScriptPurpose {
        match self {
            Self::RemoveShell | Self::RemovePowershell => ScriptPurpose::Remove,
            _ => ScriptPurpose::Enroll,
        }
    }

    pub fn render(&self, env: &Environment) -> String {
        let project = project_name(env);
        match self {
            Self::EnrollShell => fill(ENROLL_SHELL, env, &project),
            Self::EnrollPowershell => fill(ENROLL_POWERSHELL, env, &project),
            Self::RemoveShell => fill(REMOVE_SHELL, env, &project),
            Self::RemovePowershell => fill(REMOVE_POWERSHELL, env, &project),
            Self::Flags => render_flags(env, FLAG_SECRET_PLACEHOLDER, FLAG_CERT_PLACEHOLDER),
            Self::Certificate => env.certificate.clone(),
        }
    }
}

/// Placeholder replaced by installers with the local secret file path
pub const FLAG_SECRET_PLACEHOLDER: &str = "__SECRET_FILE__";

/// Placeholder replaced by installers with the local certificate path
pub const FLAG_CERT_PLACEHOLDER: &str = "__CERT_FILE__";

fn project_name(env: &Environment) -> String {
    format!("fleet-{}", env.name)
}

/// Render the agent flags file for an environment
pub fn render_flags(env: &Environment, secret_file: &str, cert_file: &str) -> String {
    let base = format!("/{}", env.uuid);
    let mut flags = vec![
        "--host_identifier=uuid".to_string(),
        "--force=true".to_string(),
        "--utc=true".to_string(),
        format!("--enroll_secret_path={}", secret_file),
        format!("--enroll_tls_endpoint={}/{}", base, env.paths.enroll),
        "--config_plugin=tls".to_string(),
        format!("--config_tls_endpoint={}/{}", base, env.paths.config),
        format!("--config_tls_refresh={}", env.config_interval),
        "--config_tls_max_attempts=5".to_string(),
        "--logger_plugin=tls".to_string(),
        "--logger_tls_compress=true".to_string(),
        format!("--logger_tls_endpoint={}/{}", base, env.paths.log),
        format!("--logger_tls_period={}", env.log_interval),
        "--disable_carver=false".to_string(),
        "--carver_disable_function=false".to_string(),
        format!("--carver_start_endpoint={}/{}", base, env.paths.carver_init),
        format!("--carver_continue_endpoint={}/{}", base, env.paths.carver_block),
        format!("--carver_block_size={}", DEFAULT_CARVER_BLOCK_SIZE),
        "--disable_distributed=false".to_string(),
        format!("--distributed_interval={}", env.query_interval),
        "--distributed_plugin=tls".to_string(),
        "--distributed_tls_max_attempts=5".to_string(),
        format!("--distributed_tls_read_endpoint={}/{}", base, env.paths.query_read),
        format!("--distributed_tls_write_endpoint={}/{}", base, env.paths.query_write),
        format!("--tls_hostname={}", env.hostname),
    ];
    if !env.certificate.is_empty() {
        flags.push(format!("--tls_server_certs={}", cert_file));
    }
    flags.join("\n") + "\n"
}

fn fill(template: &str, env: &Environment, project: &str) -> String {
    template
        .replace("{{PROJECT}}", project)
        .replace("{{SECRET}}", &env.secret)
        .replace("{{HOSTNAME}}", &env.hostname)
        .replace("{{ENV_UUID}}", &env.uuid)
        .replace("{{ENROLL_PATH}}", &env.enroll_secret_path)
        .replace("{{REMOVE_PATH}}", &env.remove_secret_path)
        .replace("{{CERTIFICATE}}", env.certificate.trim())
}

const ENROLL_SHELL: &str = r#"#!/bin/sh
#
# {{PROJECT}} - quick-add for macOS/Linux/FreeBSD nodes

_PROJECT="{{PROJECT}}"
_SECRET="{{SECRET}}"
_BASE="https://{{HOSTNAME}}/{{ENV_UUID}}/{{ENROLL_PATH}}"

fail() { echo "[!] $1"; exit 1; }
log() { echo "[+] $1"; }

case "$(uname -s)" in
  Linux) _DIR=/etc/osquery; _SERVICE=osqueryd ;;
  Darwin) _DIR=/private/var/osquery; _SERVICE=io.osquery.agent ;;
  FreeBSD) _DIR=/usr/local/etc; _SERVICE=osqueryd ;;
  *) fail "Unsupported OS" ;;
esac

command -v osqueryd >/dev/null 2>&1 || fail "osquery is not installed"

_SECRET_FILE="$_DIR/$_PROJECT.secret"
_CERT_FILE="$_DIR/certs/$_PROJECT.crt"
_FLAGS_FILE="$_DIR/osquery.flags"

log "Writing secret to $_SECRET_FILE"
sudo mkdir -p "$_DIR/certs"
echo "$_SECRET" | sudo tee "$_SECRET_FILE" >/dev/null

log "Fetching certificate"
curl -sSf "$_BASE/cert" | sudo tee "$_CERT_FILE" >/dev/null

log "Fetching flags"
curl -sSf "$_BASE/flags" \
  | sed -e "s#__SECRET_FILE__#$_SECRET_FILE#g" -e "s#__CERT_FILE__#$_CERT_FILE#g" \
  | sudo tee "$_FLAGS_FILE" >/dev/null

log "Restarting $_SERVICE"
if [ "$(uname -s)" = "Darwin" ]; then
  sudo launchctl kickstart -k "system/$_SERVICE"
else
  sudo service "$_SERVICE" restart
fi

log "Node enrolled in $_PROJECT"
"#;

const ENROLL_POWERSHELL: &str = r#"## {{PROJECT}} - quick-add for Windows nodes

$projectName = "{{PROJECT}}"
$secret = "{{SECRET}}"
$base = "https://{{HOSTNAME}}/{{ENV_UUID}}/{{ENROLL_PATH}}"
$osqueryPath = Join-Path $Env:ProgramFiles "osquery"
$secretFile = Join-Path $osqueryPath "$projectName.secret"
$certFile = Join-Path $osqueryPath "certs\$projectName.crt"
$flagsFile = Join-Path $osqueryPath "osquery.flags"

if (-not (Test-Path $osqueryPath)) {
  Write-Host "[!] osquery is not installed"
  exit 1
}

Set-Content -Path $secretFile -Value $secret -NoNewline
New-Item -ItemType Directory -Force -Path (Split-Path $certFile) | Out-Null
Invoke-WebRequest -UseBasicParsing -Uri "$base/cert" -OutFile $certFile
$flags = (Invoke-WebRequest -UseBasicParsing -Uri "$base/flags").Content
$flags = $flags.Replace("__SECRET_FILE__", $secretFile).Replace("__CERT_FILE__", $certFile)
Set-Content -Path $flagsFile -Value $flags

Restart-Service osqueryd
Write-Host "[+] Node enrolled in $projectName"
"#;

const REMOVE_SHELL: &str = r#"#!/bin/sh
#
# {{PROJECT}} - quick-remove for macOS/Linux/FreeBSD nodes

_PROJECT="{{PROJECT}}"

log() { echo "[+] $1"; }

case "$(uname -s)" in
  Linux) _DIR=/etc/osquery; _SERVICE=osqueryd ;;
  Darwin) _DIR=/private/var/osquery; _SERVICE=io.osquery.agent ;;
  FreeBSD) _DIR=/usr/local/etc; _SERVICE=osqueryd ;;
  *) echo "[!] Unsupported OS"; exit 1 ;;
esac

log "Stopping $_SERVICE"
if [ "$(uname -s)" = "Darwin" ]; then
  sudo launchctl bootout "system/$_SERVICE" 2>/dev/null
else
  sudo service "$_SERVICE" stop
fi

log "Removing $_PROJECT files"
sudo rm -f "$_DIR/$_PROJECT.secret" "$_DIR/certs/$_PROJECT.crt" "$_DIR/osquery.flags"

log "Node removed from $_PROJECT"
"#;

const REMOVE_POWERSHELL: &str = r#"## {{PROJECT}} - quick-remove for Windows nodes

$projectName = "{{PROJECT}}"
$osqueryPath = Join-Path $Env:ProgramFiles "osquery"

Stop-Service osqueryd -ErrorAction SilentlyContinue
Remove-Item -Force -ErrorAction SilentlyContinue (Join-Path $osqueryPath "$projectName.secret")
Remove-Item -Force -ErrorAction SilentlyContinue (Join-Path $osqueryPath "certs\$projectName.crt")
Remove-Item -Force -ErrorAction SilentlyContinue (Join-Path $osqueryPath "osquery.flags")

Write-Host "[+] Node removed from $projectName"
"#;
