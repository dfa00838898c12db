//! Field validation for product submissions.
//!
//! Form values arrive as text (multipart parts or stringified JSON scalars) and
//! are type-checked here before anything touches the store. JSON arrays and
//! objects never become text; they are reported as wrongly typed. Every
//! violation is collected; nothing short-circuits.

use std::{borrow::Cow, collections::HashMap};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::models::{NewProduct, ProductChanges};

const FIELD_ORDER: [&str; 4] = ["name", "price", "category_id", "offer"];

#[derive(Debug, Default, Validate)]
pub struct CreateProductForm {
    #[validate(
        required(message = "is a required field"),
        length(min = 1, message = "is a required field")
    )]
    pub name: Option<String>,
    #[validate(required(message = "is a required field"), custom = "validate_number")]
    pub price: Option<String>,
    #[validate(required(message = "is a required field"), custom = "validate_integer")]
    pub category_id: Option<String>,
    #[validate(custom = "validate_boolean")]
    pub offer: Option<String>,
    pub mistyped: Vec<String>,
}

#[derive(Debug, Default, Validate)]
pub struct UpdateProductForm {
    pub name: Option<String>,
    #[validate(custom = "validate_number")]
    pub price: Option<String>,
    #[validate(custom = "validate_integer")]
    pub category_id: Option<String>,
    #[validate(custom = "validate_boolean")]
    pub offer: Option<String>,
    pub mistyped: Vec<String>,
}

impl CreateProductForm {
    pub fn from_fields(mut fields: HashMap<String, String>) -> Self {
        CreateProductForm {
            name: fields.remove("name"),
            price: fields.remove("price"),
            category_id: fields.remove("category_id"),
            offer: fields.remove("offer"),
            mistyped: Vec::new(),
        }
    }

    pub fn with_mistyped(mut self, mistyped: Vec<String>) -> Self {
        self.mistyped = mistyped;
        self
    }

    /// Runs every check and returns the flattened violations, if any.
    pub fn violations(&self) -> Vec<String> {
        flatten(self.validate().err().as_ref(), &self.mistyped)
    }

    /// Builds the record to insert. Only meaningful once `violations` is empty;
    /// returns `None` if a required value is missing or malformed.
    pub fn into_new_product(self, path: String) -> Option<NewProduct> {
        let offer = match self.offer.as_deref() {
            Some(raw) => parse_boolean(raw)?,
            None => false,
        };

        Some(NewProduct {
            price: parse_number(self.price.as_deref()?)?,
            category_id: parse_integer(self.category_id.as_deref()?)?,
            name: self.name?,
            offer,
            path,
        })
    }
}

impl UpdateProductForm {
    pub fn from_fields(mut fields: HashMap<String, String>) -> Self {
        UpdateProductForm {
            name: fields.remove("name"),
            price: fields.remove("price"),
            category_id: fields.remove("category_id"),
            offer: fields.remove("offer"),
            mistyped: Vec::new(),
        }
    }

    pub fn with_mistyped(mut self, mistyped: Vec<String>) -> Self {
        self.mistyped = mistyped;
        self
    }

    pub fn violations(&self) -> Vec<String> {
        flatten(self.validate().err().as_ref(), &self.mistyped)
    }

    /// Values that fail to parse are dropped, so call this after `violations`.
    pub fn into_changes(self, path: Option<String>) -> ProductChanges {
        ProductChanges {
            name: self.name,
            price: self.price.as_deref().and_then(parse_number),
            category_id: self.category_id.as_deref().and_then(parse_integer),
            offer: self.offer.as_deref().and_then(parse_boolean),
            path,
        }
    }
}

/// Turns validator's per-field errors into `"<field> <message>"` strings,
/// ordered the way the form declares its fields. A mistyped field reports
/// only its type error.
pub fn flatten(errors: Option<&ValidationErrors>, mistyped: &[String]) -> Vec<String> {
    let field_errors = errors.map(ValidationErrors::field_errors).unwrap_or_default();
    let mut violations = Vec::new();

    for field in FIELD_ORDER {
        if mistyped.iter().any(|name| name == field) {
            violations.push(format!("{} must be a `{}` type", field, expected_type(field)));
            continue;
        }
        if let Some(errors) = field_errors.get(field) {
            for error in errors.iter() {
                let message = error
                    .message
                    .clone()
                    .unwrap_or_else(|| Cow::Owned(format!("is invalid ({})", error.code)));
                violations.push(format!("{} {}", field, message));
            }
        }
    }

    violations
}

fn expected_type(field: &str) -> &'static str {
    match field {
        "price" | "category_id" => "number",
        "offer" => "boolean",
        _ => "string",
    }
}

pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

pub fn parse_integer(raw: &str) -> Option<i64> {
    let value = parse_number(raw)?;
    if value.fract() != 0.0 || value.abs() > i64::MAX as f64 {
        return None;
    }
    Some(value as i64)
}

pub fn parse_boolean(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn violation(code: &'static str, message: &'static str) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(Cow::Borrowed(message));
    error
}

fn validate_number(raw: &str) -> Result<(), ValidationError> {
    match parse_number(raw) {
        Some(_) => Ok(()),
        None => Err(violation("number", "must be a `number` type")),
    }
}

fn validate_integer(raw: &str) -> Result<(), ValidationError> {
    if parse_number(raw).is_none() {
        return Err(violation("number", "must be a `number` type"));
    }
    match parse_integer(raw) {
        Some(_) => Ok(()),
        None => Err(violation("integer", "must be an integer")),
    }
}

fn validate_boolean(raw: &str) -> Result<(), ValidationError> {
    match parse_boolean(raw) {
        Some(_) => Ok(()),
        None => Err(violation("boolean", "must be a `boolean` type")),
    }
}
