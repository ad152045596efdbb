//! Input validation for registry requests
//!
//! Malformed requests are rejected before they reach the store.

use std::collections::BTreeMap;

/// Maximum network service name length (DNS name limit)
pub const SERVICE_NAME_MAX: usize = 253;
/// Maximum length of client and endpoint IDs
pub const ID_MAX: usize = 128;
/// Maximum number of labels on an endpoint
pub const LABELS_MAX: usize = 64;
/// Maximum label key length
pub const LABEL_KEY_MAX: usize = 63;
/// Maximum label value length
pub const LABEL_VALUE_MAX: usize = 255;

/// Validation error
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid {field}: {message}")]
    Field { field: String, message: String },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

impl ValidationError {
    fn field(field: &str, message: impl Into<String>) -> Self {
        Self::Field {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Validation result
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Network service name validator
///
/// Names are DNS-like: ASCII alphanumerics plus `-`, `_` and `.`,
/// starting and ending with an alphanumeric.
pub struct ServiceNameValidator {
    max_length: usize,
}

impl Default for ServiceNameValidator {
    fn default() -> Self {
        Self {
            max_length: SERVICE_NAME_MAX,
        }
    }
}

impl ServiceNameValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self, name: &str) -> ValidationResult<()> {
        if name.is_empty() {
            return Err(ValidationError::field("service_name", "is required"));
        }

        if name.len() > self.max_length {
            return Err(ValidationError::field(
                "service_name",
                format!("must be at most {} characters", self.max_length),
            ));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ValidationError::field(
                "service_name",
                "can only contain letters, numbers, '-', '_' and '.'",
            ));
        }

        let first_last_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
            && name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
        if !first_last_ok {
            return Err(ValidationError::field(
                "service_name",
                "must start and end with a letter or number",
            ));
        }

        Ok(())
    }
}

/// Validator for opaque identifiers (client and endpoint IDs)
pub struct IdValidator {
    field: &'static str,
    max_length: usize,
}

impl IdValidator {
    #[must_use]
    pub const fn new(field: &'static str) -> Self {
        Self {
            field,
            max_length: ID_MAX,
        }
    }

    pub fn validate(&self, id: &str) -> ValidationResult<()> {
        if id.trim().is_empty() {
            return Err(ValidationError::field(self.field, "is required"));
        }

        if id.len() > self.max_length {
            return Err(ValidationError::field(
                self.field,
                format!("must be at most {} characters", self.max_length),
            ));
        }

        if id.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(ValidationError::field(
                self.field,
                "cannot contain whitespace or control characters",
            ));
        }

        Ok(())
    }
}

/// Connect address validator
///
/// Accepts `host:port` and bracketed IPv6 (`[::1]:port`).
pub struct AddressValidator;

impl AddressValidator {
    pub fn validate(address: &str) -> ValidationResult<()> {
        if address.trim().is_empty() {
            return Err(ValidationError::field("address", "is required"));
        }

        if let Ok(addr) = address.parse::<std::net::SocketAddr>() {
            if addr.port() == 0 {
                return Err(ValidationError::field("address", "invalid port \"0\""));
            }
            return Ok(());
        }

        let Some((host, port)) = address.rsplit_once(':') else {
            return Err(ValidationError::field("address", "must be in host:port form"));
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(ValidationError::field("address", "host is missing or malformed"));
        }

        match port.parse::<u16>() {
            Ok(0) | Err(_) => Err(ValidationError::field(
                "address",
                format!("invalid port \"{port}\""),
            )),
            Ok(_) => Ok(()),
        }
    }
}

/// Endpoint label validator
pub struct LabelsValidator;

impl LabelsValidator {
    pub fn validate(labels: &BTreeMap<String, String>) -> ValidationResult<()> {
        if labels.len() > LABELS_MAX {
            return Err(ValidationError::field(
                "labels",
                format!("at most {LABELS_MAX} labels are allowed"),
            ));
        }

        for (key, value) in labels {
            if key.is_empty() || key.len() > LABEL_KEY_MAX {
                return Err(ValidationError::field(
                    "labels",
                    format!("key \"{key}\" must be 1-{LABEL_KEY_MAX} characters"),
                ));
            }
            if value.len() > LABEL_VALUE_MAX {
                return Err(ValidationError::field(
                    "labels",
                    format!("value for \"{key}\" must be at most {LABEL_VALUE_MAX} characters"),
                ));
            }
        }

        Ok(())
    }
}

/// Batch validator for multiple fields
pub struct Validator {
    errors: Vec<ValidationError>,
}

impl Validator {
    #[must_use]
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn validate_field<F>(&mut self, result: ValidationResult<F>) -> &mut Self {
        if let Err(e) = result {
            self.errors.push(e);
        }
        self
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> ValidationResult<()> {
        let mut errors = self.errors;
        match errors.len() {
            0 => Ok(()),
            1 => errors.pop().map_or(Ok(()), Err),
            _ => {
                let messages: Vec<String> = errors
                    .iter()
                    .map(std::string::ToString::to_string)
                    .collect();
                Err(ValidationError::Multiple(messages.join("; ")))
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_validator() {
        let validator = ServiceNameValidator::new();

        assert!(validator.validate("icmp").is_ok());
        assert!(validator.validate("icmp-responder.v2").is_ok());
        assert!(validator.validate("vpn_gateway").is_ok());

        assert!(validator.validate("").is_err());
        assert!(validator.validate("-icmp").is_err());
        assert!(validator.validate("icmp.").is_err());
        assert!(validator.validate("icmp responder").is_err());
        assert!(validator.validate(&"a".repeat(SERVICE_NAME_MAX + 1)).is_err());
    }

    #[test]
    fn test_id_validator() {
        let validator = IdValidator::new("client_id");

        assert!(validator.validate("nsc-1").is_ok());
        assert!(validator.validate("").is_err());
        assert!(validator.validate("   ").is_err());
        assert!(validator.validate("nsc 1").is_err());
        assert!(validator.validate(&"x".repeat(ID_MAX + 1)).is_err());

        let err = validator.validate("").unwrap_err();
        assert!(err.to_string().contains("client_id"));
    }

    #[test]
    fn test_address_validator() {
        assert!(AddressValidator::validate("10.0.0.1:5000").is_ok());
        assert!(AddressValidator::validate("[::1]:5000").is_ok());
        assert!(AddressValidator::validate("icmp-responder.default.svc:5000").is_ok());

        assert!(AddressValidator::validate("").is_err());
        assert!(AddressValidator::validate("10.0.0.1").is_err());
        assert!(AddressValidator::validate("10.0.0.1:0").is_err());
        assert!(AddressValidator::validate("[::1]:0").is_err());
        assert!(AddressValidator::validate("localhost:0").is_err());
        assert!(AddressValidator::validate("10.0.0.1:http").is_err());
        assert!(AddressValidator::validate(":5000").is_err());
    }

    #[test]
    fn test_labels_validator() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "icmp-responder".to_string());
        assert!(LabelsValidator::validate(&labels).is_ok());

        labels.insert(String::new(), "value".to_string());
        assert!(LabelsValidator::validate(&labels).is_err());

        let too_many: BTreeMap<String, String> = (0..=LABELS_MAX)
            .map(|i| (format!("k{i}"), "v".to_string()))
            .collect();
        assert!(LabelsValidator::validate(&too_many).is_err());
    }

    #[test]
    fn test_batch_validator() {
        let mut validator = Validator::new();
        validator
            .validate_field(ServiceNameValidator::new().validate(""))
            .validate_field(AddressValidator::validate("nope"));

        assert!(!validator.is_valid());
        let err = validator.into_result().unwrap_err();
        assert!(matches!(err, ValidationError::Multiple(_)));

        let mut validator = Validator::new();
        validator.validate_field(ServiceNameValidator::new().validate("icmp"));
        assert!(validator.into_result().is_ok());
    }
}
