use shared::error::ApiError;

const REQUIRED_FIELDS: &[(&str, &str)] = &[
    ("full_name", "Full Name"),
    ("email", "Email Address"),
    ("phone", "Phone Number"),
    ("property_value", "Estimated Property Value"),
    ("loan_amount", "Loan Amount Required"),
];

/// Field-level checks applied to a submitted application before it is stored.
/// The backend is the authority; the client performs no format validation.
pub fn validate_fields(fields: &[(String, String)]) -> Result<(), ApiError> {
    let lookup = |name: &str| {
        fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    };

    for (name, label) in REQUIRED_FIELDS {
        if lookup(name).is_none() {
            return Err(ApiError::validation(format!("{label} is required")));
        }
    }

    if let Some(email) = lookup("email") {
        if !is_plausible_email(email) {
            return Err(ApiError::validation("Please enter a valid email address"));
        }
    }

    if let Some(phone) = lookup("phone") {
        if phone.len() != 10 || !phone.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ApiError::validation("Phone number must be exactly 10 digits"));
        }
    }

    if let Some(aadhar) = lookup("aadhar_number") {
        if aadhar.len() != 12 || !aadhar.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ApiError::validation("Aadhar number must be exactly 12 digits"));
        }
    }

    if let Some(pan) = lookup("pan_number") {
        if !is_pan_format(pan) {
            return Err(ApiError::validation(
                "PAN number format should be like ABCDE1234F",
            ));
        }
    }

    for name in ["property_value", "loan_amount"] {
        if let Some(raw) = lookup(name) {
            match raw.parse::<f64>() {
                Ok(value) if value > 0.0 => {}
                _ => {
                    return Err(ApiError::validation(format!(
                        "{name} must be a positive amount"
                    )))
                }
            }
        }
    }

    Ok(())
}

fn is_plausible_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && tld.len() >= 2,
        None => false,
    }
}

fn is_pan_format(value: &str) -> bool {
    let upper = value.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    bytes.len() == 10
        && bytes[..5].iter().all(|b| b.is_ascii_uppercase())
        && bytes[5..9].iter().all(|b| b.is_ascii_digit())
        && bytes[9].is_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_fields() -> Vec<(String, String)> {
        [
            ("full_name", "Asha Rao"),
            ("email", "asha@example.com"),
            ("phone", "9876543210"),
            ("property_value", "9000000"),
            ("loan_amount", "4500000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn with(mut fields: Vec<(String, String)>, name: &str, value: &str) -> Vec<(String, String)> {
        fields.retain(|(k, _)| k != name);
        fields.push((name.to_string(), value.to_string()));
        fields
    }

    #[test]
    fn accepts_a_complete_submission() {
        assert!(validate_fields(&base_fields()).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let mut fields = base_fields();
        fields.retain(|(k, _)| k != "phone");
        let err = validate_fields(&fields).expect_err("must fail");
        assert!(err.message.contains("Phone Number"));
    }

    #[test]
    fn rejects_malformed_email_and_phone() {
        let err = validate_fields(&with(base_fields(), "email", "not-an-email"))
            .expect_err("bad email");
        assert!(err.message.contains("email"));

        let err =
            validate_fields(&with(base_fields(), "phone", "12345")).expect_err("bad phone");
        assert!(err.message.contains("10 digits"));
    }

    #[test]
    fn optional_identity_fields_are_checked_when_present() {
        let err = validate_fields(&with(base_fields(), "pan_number", "BAD123"))
            .expect_err("bad pan");
        assert!(err.message.contains("PAN"));

        assert!(validate_fields(&with(base_fields(), "pan_number", "abcde1234f")).is_ok());
        assert!(validate_fields(&with(base_fields(), "aadhar_number", "123456789012")).is_ok());
    }

    #[test]
    fn rejects_non_positive_amounts() {
        let err = validate_fields(&with(base_fields(), "loan_amount", "0"))
            .expect_err("zero amount");
        assert!(err.message.contains("loan_amount"));
    }
}
