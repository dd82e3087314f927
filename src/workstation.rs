/// Stable tag for this machine, used as half of the service's aggregation key.
///
/// Order: `WORKSTATION_ID`, then the configured value, then (macOS) the
/// Bonjour local host name, then the system host name. Later sources are only
/// consulted when the earlier ones are missing or blank.
pub fn resolve<F>(lookup: F, configured: Option<&str>) -> String
where
    F: Fn(&str) -> Option<String>,
{
    resolve_with(lookup, configured, system_host_name)
}

fn resolve_with<F, H>(lookup: F, configured: Option<&str>, host: H) -> String
where
    F: Fn(&str) -> Option<String>,
    H: FnOnce() -> Option<String>,
{
    non_blank(lookup("WORKSTATION_ID"))
        .or_else(|| non_blank(configured.map(str::to_string)))
        .or_else(|| non_blank(host()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn system_host_name() -> Option<String> {
    non_blank(local_host_name())
        .or_else(|| Some(gethostname::gethostname().to_string_lossy().into_owned()))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(target_os = "macos")]
fn local_host_name() -> Option<String> {
    let output = std::process::Command::new("scutil")
        .args(["--get", "LocalHostName"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(not(target_os = "macos"))]
fn local_host_name() -> Option<String> {
    None
}
