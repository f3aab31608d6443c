//! Filter engine - typed operators, field accessors, and the rule compiler
//!
//! A filter configuration is a list of rule groups. Rules inside a group
//! AND together; the groups OR together. Each rule names a field key, an
//! operator, and a literal:
//!
//! ```json
//! [{"request.method": {"equals": "POST"}, "cf.threatScore": {"greaterThan": 10}}]
//! ```
//!
//! Static keys come from a fixed accessor table so unknown fields and
//! operator/type mismatches are rejected when the plan compiles, not
//! discovered per request. `header:<name>` and `cookie:<name>` are dynamic
//! string-typed keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::FilterCompileError;
use crate::request::RequestContext;

/// Filter configuration types as parsed from JSON: one group maps field key
/// → operator → literal.
pub type FilterGroup = BTreeMap<String, BTreeMap<FilterOp, serde_json::Value>>;

/// A compiled route predicate. Cheap to clone, shared read-only.
pub type Predicate = Arc<dyn Fn(&RequestContext<'_>) -> bool + Send + Sync>;

/// The operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Exists,
    DoesNotExist,
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
}

impl FilterOp {
    fn as_str(self) -> &'static str {
        match self {
            FilterOp::Exists => "exists",
            FilterOp::DoesNotExist => "doesNotExist",
            FilterOp::Equals => "equals",
            FilterOp::Contains => "contains",
            FilterOp::StartsWith => "startsWith",
            FilterOp::EndsWith => "endsWith",
            FilterOp::GreaterThan => "greaterThan",
            FilterOp::LessThan => "lessThan",
        }
    }

    /// Which operators each field type accepts.
    fn valid_for(self, ty: FieldType) -> bool {
        match self {
            FilterOp::Exists | FilterOp::DoesNotExist => true,
            FilterOp::Equals => true,
            FilterOp::Contains | FilterOp::StartsWith | FilterOp::EndsWith => {
                ty == FieldType::Str
            }
            FilterOp::GreaterThan | FilterOp::LessThan => ty == FieldType::Number,
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a filterable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Number,
    Bool,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldType::Str => "string",
            FieldType::Number => "number",
            FieldType::Bool => "boolean",
        })
    }
}

/// A field value at evaluation time. `None` from an accessor means null.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessValue {
    Str(String),
    Number(f64),
    Bool(bool),
}

type Accessor = fn(&RequestContext<'_>) -> Option<AccessValue>;

/// One entry in the static accessor table.
pub struct FieldDef {
    pub key: &'static str,
    pub ty: FieldType,
    accessor: Accessor,
}

fn str_value(v: Option<&str>) -> Option<AccessValue> {
    v.map(|s| AccessValue::Str(s.to_string()))
}

fn num_value(v: Option<i64>) -> Option<AccessValue> {
    v.map(|n| AccessValue::Number(n as f64))
}

fn bool_value(v: Option<bool>) -> Option<AccessValue> {
    v.map(AccessValue::Bool)
}

/// The static accessor table. Dotted keys mirror the shape of the request:
/// `request.*` for request line fields, `url.*` for parsed-URL parts,
/// `cf.*` for edge annotations.
pub static FILTER_FIELDS: &[FieldDef] = &[
    FieldDef {
        key: "request.method",
        ty: FieldType::Str,
        accessor: |ctx| str_value(Some(ctx.request().method.as_str())),
    },
    FieldDef {
        key: "url.hostname",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.url().and_then(|u| u.host_str())),
    },
    FieldDef {
        key: "url.pathname",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.url().map(|u| u.path())),
    },
    FieldDef {
        key: "url.search",
        ty: FieldType::Str,
        accessor: |ctx| {
            ctx.url()
                .and_then(|u| u.query())
                .map(|q| AccessValue::Str(format!("?{q}")))
        },
    },
    FieldDef {
        key: "cf.asn",
        ty: FieldType::Number,
        accessor: |ctx| num_value(ctx.request().cf.asn),
    },
    FieldDef {
        key: "cf.colo",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.colo.as_deref()),
    },
    FieldDef {
        key: "cf.continent",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.continent.as_deref()),
    },
    FieldDef {
        key: "cf.country",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.country.as_deref()),
    },
    FieldDef {
        key: "cf.region",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.region.as_deref()),
    },
    FieldDef {
        key: "cf.regionCode",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.region_code.as_deref()),
    },
    FieldDef {
        key: "cf.city",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.city.as_deref()),
    },
    FieldDef {
        key: "cf.postalCode",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.postal_code.as_deref()),
    },
    FieldDef {
        key: "cf.timezone",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.timezone.as_deref()),
    },
    FieldDef {
        key: "cf.httpProtocol",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.http_protocol.as_deref()),
    },
    FieldDef {
        key: "cf.tlsCipher",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.tls_cipher.as_deref()),
    },
    FieldDef {
        key: "cf.tlsVersion",
        ty: FieldType::Str,
        accessor: |ctx| str_value(ctx.request().cf.tls_version.as_deref()),
    },
    FieldDef {
        key: "cf.clientTcpRtt",
        ty: FieldType::Number,
        accessor: |ctx| num_value(ctx.request().cf.client_tcp_rtt),
    },
    FieldDef {
        key: "cf.threatScore",
        ty: FieldType::Number,
        accessor: |ctx| num_value(ctx.request().cf.threat_score),
    },
    FieldDef {
        key: "cf.verifiedBot",
        ty: FieldType::Bool,
        accessor: |ctx| {
            bool_value(
                ctx.request()
                    .cf
                    .bot_management
                    .as_ref()
                    .and_then(|bm| bm.verified_bot),
            )
        },
    },
    FieldDef {
        key: "cf.botManagement.score",
        ty: FieldType::Number,
        accessor: |ctx| {
            num_value(
                ctx.request()
                    .cf
                    .bot_management
                    .as_ref()
                    .and_then(|bm| bm.score),
            )
        },
    },
    FieldDef {
        key: "cf.botManagement.verifiedBot",
        ty: FieldType::Bool,
        accessor: |ctx| {
            bool_value(
                ctx.request()
                    .cf
                    .bot_management
                    .as_ref()
                    .and_then(|bm| bm.verified_bot),
            )
        },
    },
    FieldDef {
        key: "cf.botManagement.ja3Hash",
        ty: FieldType::Str,
        accessor: |ctx| {
            ctx.request()
                .cf
                .bot_management
                .as_ref()
                .and_then(|bm| bm.ja3_hash.as_deref())
                .map(|s| AccessValue::Str(s.to_string()))
        },
    },
    FieldDef {
        key: "cf.botManagement.corporateProxy",
        ty: FieldType::Bool,
        accessor: |ctx| {
            bool_value(
                ctx.request()
                    .cf
                    .bot_management
                    .as_ref()
                    .and_then(|bm| bm.corporate_proxy),
            )
        },
    },
];

/// Look up a static field key.
pub fn lookup_field(key: &str) -> Option<&'static FieldDef> {
    FILTER_FIELDS.iter().find(|f| f.key == key)
}

/// Literal operand, converted from JSON once at compile time.
#[derive(Debug, Clone)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    /// Anything else (arrays, objects, null) never matches.
    Other,
}

impl From<&serde_json::Value> for Literal {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => Literal::Str(s.clone()),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => Literal::Num(f),
                None => Literal::Other,
            },
            serde_json::Value::Bool(b) => Literal::Bool(*b),
            _ => Literal::Other,
        }
    }
}

enum RuleAccessor {
    Static(Accessor),
    Header(String),
    Cookie(String),
}

struct CompiledRule {
    accessor: RuleAccessor,
    op: FilterOp,
    literal: Literal,
}

impl CompiledRule {
    fn eval(&self, ctx: &RequestContext<'_>) -> bool {
        let subject = match &self.accessor {
            RuleAccessor::Static(accessor) => accessor(ctx),
            RuleAccessor::Header(name) => str_value(ctx.header(name)),
            RuleAccessor::Cookie(name) => str_value(ctx.cookie(name)),
        };
        apply_operator(self.op, subject.as_ref(), &self.literal)
    }
}

/// Apply an operator to a subject and literal. A null subject satisfies only
/// `doesNotExist`; a subject/literal type mismatch is `false`, never an
/// error.
fn apply_operator(op: FilterOp, subject: Option<&AccessValue>, literal: &Literal) -> bool {
    let subject = match (op, subject) {
        (FilterOp::Exists, s) => return s.is_some(),
        (FilterOp::DoesNotExist, s) => return s.is_none(),
        (_, None) => return false,
        (_, Some(s)) => s,
    };

    match (op, subject, literal) {
        (FilterOp::Equals, AccessValue::Str(s), Literal::Str(l)) => s == l,
        (FilterOp::Equals, AccessValue::Number(n), Literal::Num(l)) => n == l,
        (FilterOp::Equals, AccessValue::Bool(b), Literal::Bool(l)) => b == l,
        (FilterOp::Contains, AccessValue::Str(s), Literal::Str(l)) => s.contains(l.as_str()),
        (FilterOp::StartsWith, AccessValue::Str(s), Literal::Str(l)) => s.starts_with(l.as_str()),
        (FilterOp::EndsWith, AccessValue::Str(s), Literal::Str(l)) => s.ends_with(l.as_str()),
        (FilterOp::GreaterThan, AccessValue::Number(n), Literal::Num(l)) => n > l,
        (FilterOp::LessThan, AccessValue::Number(n), Literal::Num(l)) => n < l,
        _ => false,
    }
}

fn compile_rule(
    key: &str,
    op: FilterOp,
    literal: &serde_json::Value,
) -> Result<CompiledRule, FilterCompileError> {
    let (accessor, ty) = if let Some(name) = key.strip_prefix("header:") {
        (RuleAccessor::Header(name.to_string()), FieldType::Str)
    } else if let Some(name) = key.strip_prefix("cookie:") {
        (RuleAccessor::Cookie(name.to_string()), FieldType::Str)
    } else {
        let field = lookup_field(key).ok_or_else(|| FilterCompileError::UnknownField {
            key: key.to_string(),
        })?;
        (RuleAccessor::Static(field.accessor), field.ty)
    };

    if !op.valid_for(ty) {
        return Err(FilterCompileError::InvalidOperator {
            key: key.to_string(),
            op,
            ty,
        });
    }

    Ok(CompiledRule {
        accessor,
        op,
        literal: Literal::from(literal),
    })
}

/// Compile a filter configuration into a predicate.
///
/// `None` or an empty list compiles to a constant-true predicate. Unknown
/// fields and operator/type mismatches fail compilation; the plan compiler
/// decides what to do with the failure.
pub fn compile_filter(groups: Option<&[FilterGroup]>) -> Result<Predicate, FilterCompileError> {
    let groups = match groups {
        Some(groups) if !groups.is_empty() => groups,
        _ => return Ok(Arc::new(|_| true)),
    };

    let mut compiled: Vec<Vec<CompiledRule>> = Vec::with_capacity(groups.len());
    for group in groups {
        let mut rules = Vec::new();
        for (key, ops) in group {
            for (op, literal) in ops {
                rules.push(compile_rule(key, *op, literal)?);
            }
        }
        compiled.push(rules);
    }

    Ok(Arc::new(move |ctx| {
        compiled
            .iter()
            .any(|group| group.iter().all(|rule| rule.eval(ctx)))
    }))
}

/// Parse a filter configuration from its JSON string form.
pub fn parse_filter_json(raw: &str) -> Result<Vec<FilterGroup>, serde_json::Error> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{BotManagement, EdgeData, LogRequest};
    use serde_json::json;

    fn groups(value: serde_json::Value) -> Vec<FilterGroup> {
        serde_json::from_value(value).unwrap()
    }

    fn matches(filter: serde_json::Value, request: &LogRequest) -> bool {
        let groups = groups(filter);
        let predicate = compile_filter(Some(&groups)).unwrap();
        predicate(&RequestContext::new(request))
    }

    #[test]
    fn test_empty_filter_is_constant_true() {
        let predicate = compile_filter(None).unwrap();
        let request = LogRequest::new("GET", "https://example.com/");
        assert!(predicate(&RequestContext::new(&request)));

        let predicate = compile_filter(Some(&[])).unwrap();
        assert!(predicate(&RequestContext::new(&request)));
    }

    #[test]
    fn test_header_equals() {
        let filter = json!([{"header:x-ab-test-group": {"equals": "B"}}]);
        let with = LogRequest::new("GET", "https://example.com/")
            .with_header("X-AB-Test-Group", "B");
        let without = LogRequest::new("GET", "https://example.com/");
        assert!(matches(filter.clone(), &with));
        assert!(!matches(filter, &without));
    }

    #[test]
    fn test_cookie_rule() {
        let filter = json!([{"cookie:sId": {"exists": true}}]);
        let with = LogRequest::new("GET", "https://example.com/")
            .with_header("Cookie", "sId=123");
        let without = LogRequest::new("GET", "https://example.com/");
        assert!(matches(filter.clone(), &with));
        assert!(!matches(filter, &without));
    }

    #[test]
    fn test_groups_or_rules_and() {
        // (method = POST AND threatScore > 10) OR (pathname startsWith /api)
        let filter = json!([
            {"request.method": {"equals": "POST"}, "cf.threatScore": {"greaterThan": 10}},
            {"url.pathname": {"startsWith": "/api"}}
        ]);

        let mut post = LogRequest::new("POST", "https://example.com/other");
        post.cf.threat_score = Some(50);
        assert!(matches(filter.clone(), &post));

        // First group half-satisfied, second group unsatisfied
        let mut post_low = LogRequest::new("POST", "https://example.com/other");
        post_low.cf.threat_score = Some(5);
        assert!(!matches(filter.clone(), &post_low));

        let api = LogRequest::new("GET", "https://example.com/api/v1");
        assert!(matches(filter, &api));
    }

    #[test]
    fn test_null_subject_semantics() {
        let request = LogRequest::new("GET", "https://example.com/");
        assert!(matches(json!([{"cf.colo": {"doesNotExist": true}}]), &request));
        assert!(!matches(json!([{"cf.colo": {"exists": true}}]), &request));
        assert!(!matches(json!([{"cf.colo": {"equals": "AMS"}}]), &request));
    }

    #[test]
    fn test_type_mismatch_is_false_not_error() {
        // Number literal against a string field
        let request = LogRequest::new("GET", "https://example.com/");
        assert!(!matches(json!([{"request.method": {"equals": 3}}]), &request));
    }

    #[test]
    fn test_bot_management_fields() {
        let filter = json!([{"cf.botManagement.score": {"lessThan": 30}}]);
        let bot = LogRequest::new("GET", "https://example.com/").with_cf(EdgeData {
            bot_management: Some(BotManagement {
                score: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(matches(filter.clone(), &bot));

        // No bot management bag at all: null subject, no match
        let plain = LogRequest::new("GET", "https://example.com/");
        assert!(!matches(filter, &plain));
    }

    #[test]
    fn test_unknown_field_is_compile_error() {
        let field_groups = groups(json!([{"cf.nonsense": {"equals": "x"}}]));
        let err = match compile_filter(Some(&field_groups)) {
            Err(e) => e,
            Ok(_) => panic!("expected compile error"),
        };
        assert!(matches!(err, FilterCompileError::UnknownField { .. }));
    }

    #[test]
    fn test_operator_type_mismatch_is_compile_error() {
        // contains on a number field
        let field_groups = groups(json!([{"cf.threatScore": {"contains": "1"}}]));
        let err = match compile_filter(Some(&field_groups)) {
            Err(e) => e,
            Ok(_) => panic!("expected compile error"),
        };
        assert!(matches!(err, FilterCompileError::InvalidOperator { .. }));

        // greaterThan on a dynamic header (string-typed)
        let field_groups = groups(json!([{"header:x-count": {"greaterThan": 3}}]));
        assert!(compile_filter(Some(&field_groups)).is_err());
    }

    #[test]
    fn test_operator_serde_names() {
        let op: FilterOp = serde_json::from_value(json!("doesNotExist")).unwrap();
        assert_eq!(op, FilterOp::DoesNotExist);
        let op: FilterOp = serde_json::from_value(json!("startsWith")).unwrap();
        assert_eq!(op, FilterOp::StartsWith);
    }
}
