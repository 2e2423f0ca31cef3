//! Helper functions for [`toml_span`].

use std::borrow::Cow;

use toml_span::DeserError;

use crate::prelude::*;

/// Deserialize a TOML string into a value of the specified type.
pub fn from_toml_str<'de, T>(toml_str: &'de str) -> Result<T, DeserError>
where
    T: toml_span::Deserialize<'de>,
{
    let mut value = toml_span::de::parse(toml_str)?;
    T::deserialize(&mut value)
}

/// Parse a TOML file, turning any errors into a readable message that
/// includes line numbers.
pub fn parse_toml_file<T>(path: &Path, toml_str: &str) -> Result<T>
where
    T: for<'de> toml_span::Deserialize<'de>,
{
    from_toml_str(toml_str).map_err(|err| {
        let messages = err
            .errors
            .iter()
            .map(|err| {
                let line = toml_str[..err.span.start.min(toml_str.len())]
                    .matches('\n')
                    .count()
                    + 1;
                format!("line {line}: {err}")
            })
            .collect::<Vec<_>>();
        anyhow!("{}: {}", path.display(), messages.join("; "))
    })
}

/// Create a custom [`DeserError`] with a span.
pub fn custom_deser_error(
    span: toml_span::Span,
    msg: impl Into<Cow<'static, str>>,
) -> DeserError {
    let err_kind = toml_span::ErrorKind::Custom(msg.into());
    let err = toml_span::Error::from((err_kind, span));
    DeserError::from(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Point {
        x: u32,
        label: Option<String>,
    }

    impl<'de> toml_span::Deserialize<'de> for Point {
        fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
            let mut th = toml_span::de_helpers::TableHelper::new(value)?;
            let x = th.required("x")?;
            let label = th.optional("label");
            th.finalize(None)?;
            Ok(Point { x, label })
        }
    }

    #[test]
    fn parses_tables() {
        let point: Point = from_toml_str("x = 3\nlabel = \"a\"").unwrap();
        assert_eq!(point.x, 3);
        assert_eq!(point.label.as_deref(), Some("a"));
    }

    #[test]
    fn reports_line_numbers() {
        let err = parse_toml_file::<Point>(Path::new("cfg.toml"), "\n\nx = \"three\"\n")
            .err()
            .unwrap();
        let msg = err.to_string();
        assert!(msg.starts_with("cfg.toml: line 3"), "{msg}");
    }
}
