use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(String),
    #[error("invalid value `{value}` for {name}")]
    Invalid { name: String, value: String },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_variant_names_the_variable() {
        let err = ConfigError::Invalid { name: "GATEWAY_BIND".into(),
                                         value: "nope".into() };
        assert_eq!(err.to_string(), "invalid value `nope` for GATEWAY_BIND");
    }

    #[test]
    fn missing_variant_format() {
        let err = ConfigError::Missing("GATEWAY_WEBHOOK_SECRET".into());
        assert_eq!(err.to_string(), "missing required variable GATEWAY_WEBHOOK_SECRET");
    }
}
