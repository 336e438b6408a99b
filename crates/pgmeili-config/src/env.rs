use crate::error::{ConfigError, ConfigResult};

/// Substitute `${VAR}` references from the environment.
///
/// `${VAR:-fallback}` uses `fallback` when `VAR` is unset or empty. A bare
/// `${VAR}` that is unset is an error naming `field`.
pub fn resolve_env(value: &str, field: &str) -> ConfigResult<String> {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::UnterminatedVariable {
                field: field.to_string(),
            })?;
        let reference = &after[..end];

        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };
        let resolved = match (std::env::var(name).ok().filter(|v| !v.is_empty()), fallback) {
            (Some(v), _) => v,
            (None, Some(fallback)) => fallback.to_string(),
            (None, None) => {
                return Err(ConfigError::MissingEnvVar {
                    name: name.to_string(),
                    field: field.to_string(),
                })
            }
        };
        result.push_str(&resolved);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}
