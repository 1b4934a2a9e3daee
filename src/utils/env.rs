/// Get environment variable with TOLLGATE_ prefix, falling back to unprefixed version
///
/// Checks `TOLLGATE_{key}` first, then `{key}`, so deployments can keep their
/// usual variable names (`JWT_SECRET`, `STRIPE_WEBHOOK_SECRET`, ...).
///
/// # Examples
///
/// ```rust,ignore
/// use tollgate::utils::get_env_with_prefix;
///
/// // Checks TOLLGATE_BILLING_PERIOD_DAYS first, then BILLING_PERIOD_DAYS
/// let days = get_env_with_prefix("BILLING_PERIOD_DAYS");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TOLLGATE_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Read and parse an environment variable, ignoring values that fail to parse.
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    match get_env_with_prefix(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable environment variable");
                None
            }
        },
        None => None,
    }
}
