use crate::error::{CallFailure, FailureKind};
use serde_json::Value;

/// The closed set of calls a caller may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    OpenDocument,
    GetPagePixmap,
    EvaluateExpression,
}

impl Method {
    pub const ALL: [Method; 3] = [
        Method::OpenDocument,
        Method::GetPagePixmap,
        Method::EvaluateExpression,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::OpenDocument => "openDocument",
            Method::GetPagePixmap => "getPagePixmap",
            Method::EvaluateExpression => "evaluateExpression",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.name() == name)
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.into_iter().map(Method::name).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    OpenDocument { path: String },
    GetPagePixmap { page: i32 },
    EvaluateExpression { expression: String },
}

impl Operation {
    pub fn resolve(name: &str, args: &[Value]) -> Result<Self, CallFailure> {
        let method = Method::from_name(name).ok_or_else(|| {
            CallFailure::new(
                FailureKind::UnknownMethod,
                format!("no method named `{name}`"),
            )
        })?;

        Self::parse(method, args)
    }

    pub fn parse(method: Method, args: &[Value]) -> Result<Self, CallFailure> {
        match method {
            Method::OpenDocument => {
                let [path] = expect_arity::<1>(method, args)?;
                Ok(Operation::OpenDocument {
                    path: c_string_arg(method, 0, path)?,
                })
            }
            Method::GetPagePixmap => {
                let [page] = expect_arity::<1>(method, args)?;
                let page = page
                    .as_i64()
                    .and_then(|page| i32::try_from(page).ok())
                    .ok_or_else(|| {
                        CallFailure::invalid_arguments(format!(
                            "{}: argument 0 must be a 32-bit integer page index, got {page}",
                            method.name()
                        ))
                    })?;
                Ok(Operation::GetPagePixmap { page })
            }
            Method::EvaluateExpression => {
                let [expression] = expect_arity::<1>(method, args)?;
                Ok(Operation::EvaluateExpression {
                    expression: c_string_arg(method, 0, expression)?,
                })
            }
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Operation::OpenDocument { .. } => Method::OpenDocument,
            Operation::GetPagePixmap { .. } => Method::GetPagePixmap,
            Operation::EvaluateExpression { .. } => Method::EvaluateExpression,
        }
    }
}

fn expect_arity<const N: usize>(method: Method, args: &[Value]) -> Result<&[Value; N], CallFailure> {
    <&[Value; N]>::try_from(args).map_err(|_| {
        CallFailure::invalid_arguments(format!(
            "{} expects {N} argument(s), got {}",
            method.name(),
            args.len()
        ))
    })
}

fn c_string_arg(method: Method, index: usize, value: &Value) -> Result<String, CallFailure> {
    let Some(text) = value.as_str() else {
        return Err(CallFailure::invalid_arguments(format!(
            "{}: argument {index} must be a string, got {value}",
            method.name()
        )));
    };

    if text.contains('\0') {
        return Err(CallFailure::invalid_arguments(format!(
            "{}: argument {index} contains a NUL byte",
            method.name()
        )));
    }

    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_names_round_trip() {
        for method in Method::ALL {
            assert_eq!(Method::from_name(method.name()), Some(method));
        }
        assert_eq!(
            Method::names(),
            vec!["openDocument", "getPagePixmap", "evaluateExpression"]
        );
    }

    #[test]
    fn unknown_name_is_unknown_method() {
        let err = Operation::resolve("evalScheme", &[json!("(+ 1 2)")]).expect_err("unknown");
        assert_eq!(err.kind, FailureKind::UnknownMethod);
        assert!(err.message.contains("evalScheme"));
    }

    #[test]
    fn parses_each_operation() {
        assert_eq!(
            Operation::resolve("openDocument", &[json!("sample.pdf")]).expect("open"),
            Operation::OpenDocument {
                path: "sample.pdf".to_string()
            }
        );
        assert_eq!(
            Operation::resolve("getPagePixmap", &[json!(3)]).expect("pixmap"),
            Operation::GetPagePixmap { page: 3 }
        );
        assert_eq!(
            Operation::resolve("evaluateExpression", &[json!("(foo)")]).expect("eval"),
            Operation::EvaluateExpression {
                expression: "(foo)".to_string()
            }
        );
    }

    #[test]
    fn arity_mismatch_is_invalid_arguments() {
        let err = Operation::resolve("openDocument", &[]).expect_err("missing arg");
        assert_eq!(err.kind, FailureKind::InvalidArguments);

        let err = Operation::resolve("getPagePixmap", &[json!(0), json!(1)]).expect_err("extra");
        assert_eq!(err.kind, FailureKind::InvalidArguments);
    }

    #[test]
    fn argument_types_are_checked() {
        let err = Operation::resolve("getPagePixmap", &[json!("0")]).expect_err("string page");
        assert_eq!(err.kind, FailureKind::InvalidArguments);

        let err = Operation::resolve("getPagePixmap", &[json!(1_u64 << 40)]).expect_err("wide");
        assert_eq!(err.kind, FailureKind::InvalidArguments);

        let err = Operation::resolve("openDocument", &[json!(7)]).expect_err("numeric path");
        assert_eq!(err.kind, FailureKind::InvalidArguments);

        let err = Operation::resolve("openDocument", &[json!("a\u{0}b")]).expect_err("nul");
        assert_eq!(err.kind, FailureKind::InvalidArguments);
    }
}
