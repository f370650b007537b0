use filevault_storage::CompletedPart;

/// Initialize tracing for the CLI. Logs go to stderr so stdout stays JSON.
///
/// `LOG_FORMAT=json` switches to one JSON object per event.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("filevault=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Parse a `--part` argument of the form `number:etag`.
pub fn parse_part(s: &str) -> Result<CompletedPart, String> {
    let (number, etag) = s
        .split_once(':')
        .ok_or_else(|| format!("expected NUMBER:ETAG, got '{}'", s))?;
    let part_number = number
        .trim()
        .parse::<i32>()
        .map_err(|_| format!("invalid part number '{}'", number))?;
    let etag = etag.trim();
    if etag.is_empty() {
        return Err(format!("missing ETag for part {}", part_number));
    }
    Ok(CompletedPart {
        part_number,
        etag: etag.to_string(),
    })
}
