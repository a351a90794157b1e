//! Binding path captures and query parameters into request messages

use crate::pattern::Captures;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::Bytes;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, ReflectMessage, Value};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

/// Client input that cannot be bound into the request message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("field {path:?}: {message} has no field {segment:?}")]
    UnknownField {
        path: String,
        segment: String,
        message: String,
    },

    #[error("field {path:?}: cannot traverse {segment:?}, it is not a singular message")]
    NotTraversable { path: String, segment: String },

    #[error("field {path:?}: cannot bind a value to a {kind} field")]
    Unsupported { path: String, kind: String },

    #[error("field {path:?}: invalid value {value:?}: {reason}")]
    InvalidValue {
        path: String,
        value: String,
        reason: String,
    },

    #[error("field {path:?}: expected one value, got {count}")]
    TooManyValues { path: String, count: usize },
}

impl BindError {
    /// Dotted path of the field the error refers to
    pub fn field_path(&self) -> &str {
        match self {
            BindError::UnknownField { path, .. }
            | BindError::NotTraversable { path, .. }
            | BindError::Unsupported { path, .. }
            | BindError::InvalidValue { path, .. }
            | BindError::TooManyValues { path, .. } => path,
        }
    }
}

/// Which query parameters may be bound
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QueryFilter {
    /// Any field not already bound from the path or body
    #[default]
    All,
    /// Only the listed dotted paths and their descendants
    Only(BTreeSet<String>),
}

impl QueryFilter {
    pub fn only<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        QueryFilter::Only(paths.into_iter().map(Into::into).collect())
    }

    fn allows(&self, key: &str, bound: &[String]) -> bool {
        if bound.iter().any(|b| covers(b, key)) {
            return false;
        }
        match self {
            QueryFilter::All => true,
            QueryFilter::Only(allowed) => allowed.iter().any(|a| covers(a, key)),
        }
    }
}

/// `key` is `prefix` or one of its descendants
fn covers(prefix: &str, key: &str) -> bool {
    key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Set the field at a dotted path, creating intermediate messages
///
/// Repeated fields take every value; singular fields take exactly one.
pub fn bind_field(
    message: &mut DynamicMessage,
    field_path: &str,
    values: &[&str],
) -> Result<(), BindError> {
    let segments: Vec<&str> = field_path.split('.').collect();
    bind_segments(message, field_path, &segments, values)
}

/// Bind every path capture to the field it names
pub fn bind_path_params(message: &mut DynamicMessage, captures: &Captures) -> Result<(), BindError> {
    for (name, value) in captures.iter() {
        bind_field(message, name, &[value])?;
    }
    Ok(())
}

/// Bind URL query parameters
///
/// `bound` lists the field paths already set from the path or body; they and
/// their descendants are never overwritten from the query. Keys that are
/// filtered out or name no field are ignored.
pub fn bind_query(
    message: &mut DynamicMessage,
    query: &str,
    filter: &QueryFilter,
    bound: &[String],
) -> Result<(), BindError> {
    let mut params: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key.is_empty() {
            continue;
        }
        match params.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value.into_owned()),
            None => params.push((key.into_owned(), vec![value.into_owned()])),
        }
    }

    for (key, values) in &params {
        if !filter.allows(key, bound) {
            debug!("Ignoring query parameter {:?}", key);
            continue;
        }
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        match bind_field(message, key, &values) {
            Err(BindError::UnknownField { .. }) => {
                debug!("Ignoring query parameter {:?}: no such field", key);
            }
            other => other?,
        }
    }
    Ok(())
}

fn find_field(descriptor: &MessageDescriptor, name: &str) -> Option<FieldDescriptor> {
    descriptor
        .get_field_by_name(name)
        .or_else(|| descriptor.get_field_by_json_name(name))
}

fn bind_segments(
    message: &mut DynamicMessage,
    path: &str,
    segments: &[&str],
    values: &[&str],
) -> Result<(), BindError> {
    let Some((segment, rest)) = segments.split_first() else {
        return Ok(());
    };
    let descriptor = message.descriptor();
    let field = find_field(&descriptor, segment).ok_or_else(|| BindError::UnknownField {
        path: path.to_string(),
        segment: segment.to_string(),
        message: descriptor.full_name().to_string(),
    })?;

    if !rest.is_empty() {
        if field.is_list() || field.is_map() || !matches!(field.kind(), Kind::Message(_)) {
            return Err(BindError::NotTraversable {
                path: path.to_string(),
                segment: segment.to_string(),
            });
        }
        return match message.get_field_mut(&field) {
            Value::Message(nested) => bind_segments(nested, path, rest, values),
            _ => Err(BindError::NotTraversable {
                path: path.to_string(),
                segment: segment.to_string(),
            }),
        };
    }

    if field.is_map() {
        return Err(BindError::Unsupported {
            path: path.to_string(),
            kind: "map".to_string(),
        });
    }

    if field.is_list() {
        let parsed = values
            .iter()
            .map(|v| parse_value(path, &field.kind(), v))
            .collect::<Result<Vec<_>, _>>()?;
        if let Value::List(list) = message.get_field_mut(&field) {
            list.extend(parsed);
        }
        return Ok(());
    }

    match values {
        [] => Ok(()),
        [value] => {
            let parsed = parse_value(path, &field.kind(), value)?;
            message.set_field(&field, parsed);
            Ok(())
        }
        _ => Err(BindError::TooManyValues {
            path: path.to_string(),
            count: values.len(),
        }),
    }
}

fn invalid(path: &str, value: &str, reason: impl ToString) -> BindError {
    BindError::InvalidValue {
        path: path.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_value(path: &str, kind: &Kind, value: &str) -> Result<Value, BindError> {
    let err = |reason: &dyn ToString| invalid(path, value, reason.to_string());
    Ok(match kind {
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            Value::I32(value.parse().map_err(|e| err(&e))?)
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            Value::I64(value.parse().map_err(|e| err(&e))?)
        }
        Kind::Uint32 | Kind::Fixed32 => Value::U32(value.parse().map_err(|e| err(&e))?),
        Kind::Uint64 | Kind::Fixed64 => Value::U64(value.parse().map_err(|e| err(&e))?),
        Kind::Float => Value::F32(value.parse().map_err(|e| err(&e))?),
        Kind::Double => Value::F64(value.parse().map_err(|e| err(&e))?),
        Kind::Bool => match value {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(err(&"expected true or false")),
        },
        Kind::String => Value::String(value.to_string()),
        Kind::Bytes => Value::Bytes(decode_base64(value).ok_or_else(|| err(&"invalid base64"))?),
        Kind::Enum(descriptor) => match descriptor.get_value_by_name(value) {
            Some(v) => Value::EnumNumber(v.number()),
            None => {
                let number: i32 = value
                    .parse()
                    .map_err(|_| err(&format!("not a value of {}", descriptor.full_name())))?;
                Value::EnumNumber(number)
            }
        },
        Kind::Message(descriptor) => parse_well_known(path, descriptor, value)?,
    })
}

fn decode_base64(value: &str) -> Option<Bytes> {
    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(value).ok())
        .map(Bytes::from)
}

/// Well-known types that have a textual JSON form
fn parse_well_known(path: &str, descriptor: &MessageDescriptor, value: &str) -> Result<Value, BindError> {
    match descriptor.full_name() {
        "google.protobuf.Timestamp" | "google.protobuf.Duration" | "google.protobuf.FieldMask" => {
            let json = serde_json::Value::String(value.to_string());
            let message = DynamicMessage::deserialize(descriptor.clone(), json)
                .map_err(|e| invalid(path, value, e))?;
            Ok(Value::Message(message))
        }
        "google.protobuf.DoubleValue"
        | "google.protobuf.FloatValue"
        | "google.protobuf.Int64Value"
        | "google.protobuf.UInt64Value"
        | "google.protobuf.Int32Value"
        | "google.protobuf.UInt32Value"
        | "google.protobuf.BoolValue"
        | "google.protobuf.StringValue"
        | "google.protobuf.BytesValue" => {
            let mut wrapper = DynamicMessage::new(descriptor.clone());
            let field = descriptor.get_field_by_name("value").ok_or_else(|| BindError::Unsupported {
                path: path.to_string(),
                kind: descriptor.full_name().to_string(),
            })?;
            wrapper.set_field(&field, parse_value(path, &field.kind(), value)?);
            Ok(Value::Message(wrapper))
        }
        other => Err(BindError::Unsupported {
            path: path.to_string(),
            kind: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PathPattern;
    use gantry_proto::system::v1::{Idp, IdpKind, ListIdpsRequest};
    use prost::Message;

    fn empty(name: &str) -> DynamicMessage {
        let pool = gantry_proto::descriptor_pool().unwrap();
        DynamicMessage::new(pool.get_message_by_name(name).unwrap())
    }

    fn to_idp(message: &DynamicMessage) -> Idp {
        Idp::decode(message.encode_to_vec().as_slice()).unwrap()
    }

    #[test]
    fn test_bind_nested_capture() {
        let pattern = PathPattern::compile("/auth/v3/sso/idp/{metadata.name}").unwrap();
        let captures = pattern.matches("/auth/v3/sso/idp/okta1").unwrap();

        let mut message = empty("gantry.system.v1.Idp");
        bind_path_params(&mut message, &captures).unwrap();
        assert_eq!(to_idp(&message).metadata.unwrap().name, "okta1");
    }

    #[test]
    fn test_scalar_coercion() {
        let mut message = empty("gantry.system.v1.Idp");
        bind_field(&mut message, "spec.priority", &["-7"]).unwrap();
        bind_field(&mut message, "spec.weight", &["0.25"]).unwrap();
        bind_field(&mut message, "spec.saveConfig", &["true"]).unwrap();
        bind_field(&mut message, "spec.kind", &["IDP_KIND_OIDC"]).unwrap();
        bind_field(&mut message, "spec.max_sessions", &["9000000000"]).unwrap();
        bind_field(&mut message, "spec.port", &["8443"]).unwrap();
        bind_field(&mut message, "spec.certificate", &["aGVsbG8"]).unwrap();

        let spec = to_idp(&message).spec.unwrap();
        assert_eq!(spec.priority, -7);
        assert_eq!(spec.weight, 0.25);
        assert!(spec.save_config);
        assert_eq!(spec.kind, IdpKind::Oidc as i32);
        assert_eq!(spec.max_sessions, 9_000_000_000);
        assert_eq!(spec.port, 8443);
        assert_eq!(spec.certificate, b"hello");
    }

    #[test]
    fn test_enum_by_number() {
        let mut message = empty("gantry.system.v1.Idp");
        bind_field(&mut message, "spec.kind", &["1"]).unwrap();
        assert_eq!(to_idp(&message).spec.unwrap().kind, IdpKind::Saml as i32);

        let err = bind_field(&mut message, "spec.kind", &["LDAP"]).unwrap_err();
        assert!(matches!(err, BindError::InvalidValue { .. }));
    }

    #[test]
    fn test_invalid_values() {
        let mut message = empty("gantry.system.v1.Idp");
        let err = bind_field(&mut message, "spec.priority", &["high"]).unwrap_err();
        assert_eq!(err.field_path(), "spec.priority");
        assert!(matches!(err, BindError::InvalidValue { .. }));

        assert!(bind_field(&mut message, "spec.save_config", &["yes"]).is_err());
        assert!(bind_field(&mut message, "spec.save_config", &["1"]).is_err());
        assert!(bind_field(&mut message, "spec.port", &["-1"]).is_err());
    }

    #[test]
    fn test_path_errors() {
        let mut message = empty("gantry.system.v1.Idp");
        let err = bind_field(&mut message, "metadata.nickname", &["x"]).unwrap_err();
        assert_eq!(
            err,
            BindError::UnknownField {
                path: "metadata.nickname".to_string(),
                segment: "nickname".to_string(),
                message: "gantry.system.v1.Metadata".to_string(),
            }
        );

        let err = bind_field(&mut message, "kind.name", &["x"]).unwrap_err();
        assert!(matches!(err, BindError::NotTraversable { .. }));

        let err = bind_field(&mut message, "metadata.labels", &["x"]).unwrap_err();
        assert!(matches!(err, BindError::Unsupported { .. }));

        let err = bind_field(&mut message, "spec.name", &["a", "b"]).unwrap_err();
        assert_eq!(
            err,
            BindError::TooManyValues {
                path: "spec.name".to_string(),
                count: 2
            }
        );
    }

    #[test]
    fn test_repeated_appends() {
        let mut message = empty("gantry.system.v1.Idp");
        bind_field(&mut message, "spec.groups", &["admins", "ops"]).unwrap();
        bind_field(&mut message, "spec.groups", &["dev"]).unwrap();
        assert_eq!(to_idp(&message).spec.unwrap().groups, vec!["admins", "ops", "dev"]);
    }

    #[test]
    fn test_well_known_types() {
        let mut message = empty("gantry.system.v1.Idp");
        bind_field(&mut message, "metadata.created_at", &["2024-05-01T10:00:00Z"]).unwrap();
        let created = to_idp(&message).metadata.unwrap().created_at.unwrap();
        assert_eq!(created.seconds, 1_714_557_600);

        let err = bind_field(&mut message, "metadata.created_at", &["yesterday"]).unwrap_err();
        assert!(matches!(err, BindError::InvalidValue { .. }));
    }

    #[test]
    fn test_query_binding() {
        let mut message = empty("gantry.system.v1.ListIdpsRequest");
        bind_query(
            &mut message,
            "offset=20&limit=10&kinds=IDP_KIND_SAML&kinds=2&page_hint=abc&partner=acme%20corp",
            &QueryFilter::All,
            &[],
        )
        .unwrap();

        let request = ListIdpsRequest::decode(message.encode_to_vec().as_slice()).unwrap();
        assert_eq!(request.offset, 20);
        assert_eq!(request.limit, 10);
        assert_eq!(request.partner, "acme corp");
        assert_eq!(request.kinds, vec![IdpKind::Saml as i32, IdpKind::Oidc as i32]);
    }

    #[test]
    fn test_query_filter() {
        let mut message = empty("gantry.system.v1.Idp");
        bind_query(
            &mut message,
            "metadata.name=evil&metadata.partner=acme&spec.name=x&kind=Idp",
            &QueryFilter::only(["metadata", "kind"]),
            &["metadata.name".to_string()],
        )
        .unwrap();

        let idp = to_idp(&message);
        let metadata = idp.metadata.unwrap();
        assert_eq!(metadata.name, "");
        assert_eq!(metadata.partner, "acme");
        assert_eq!(idp.kind, "Idp");
        assert!(idp.spec.is_none());
    }

    #[test]
    fn test_query_skips_body_bound_field() {
        let mut message = empty("gantry.system.v1.Idp");
        bind_query(&mut message, "spec.name=x&kind=Idp", &QueryFilter::All, &["spec".to_string()])
            .unwrap();
        let idp = to_idp(&message);
        assert!(idp.spec.is_none());
        assert_eq!(idp.kind, "Idp");
    }

    #[test]
    fn test_query_invalid_value_is_error() {
        let mut message = empty("gantry.system.v1.ListIdpsRequest");
        let err = bind_query(&mut message, "limit=ten", &QueryFilter::All, &[]).unwrap_err();
        assert_eq!(err.field_path(), "limit");
    }

    #[test]
    fn test_covers() {
        assert!(covers("metadata", "metadata"));
        assert!(covers("metadata", "metadata.name"));
        assert!(!covers("metadata", "metadata_name"));
        assert!(!covers("metadata.name", "metadata"));
    }
}
