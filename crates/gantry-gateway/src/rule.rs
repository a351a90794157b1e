//! Route specs and `google.api.http` annotations

use crate::binder::QueryFilter;
use crate::error::RegistrationError;
use gantry_proto::google::api::{http_rule::Pattern, HttpRule};
use http::Method;
use prost::Message;
use prost_reflect::{MethodDescriptor, Value};

/// Name of the method option carrying HTTP rules
pub const HTTP_EXTENSION: &str = "google.api.http";

/// HTTP binding of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub method: Method,
    pub template: String,
    /// `*` for the whole request, a top-level field name, or no body
    pub body: Option<String>,
    /// Field of the response written as body instead of the whole response
    pub response_body: Option<String>,
    pub query: QueryFilter,
}

impl RouteSpec {
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
            body: None,
            response_body: None,
            query: QueryFilter::All,
        }
    }

    pub fn get(template: impl Into<String>) -> Self {
        Self::new(Method::GET, template)
    }

    pub fn post(template: impl Into<String>) -> Self {
        Self::new(Method::POST, template)
    }

    pub fn put(template: impl Into<String>) -> Self {
        Self::new(Method::PUT, template)
    }

    pub fn patch(template: impl Into<String>) -> Self {
        Self::new(Method::PATCH, template)
    }

    pub fn delete(template: impl Into<String>) -> Self {
        Self::new(Method::DELETE, template)
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into()).filter(|b: &String| !b.is_empty());
        self
    }

    pub fn with_response_body(mut self, field: impl Into<String>) -> Self {
        self.response_body = Some(field.into()).filter(|f: &String| !f.is_empty());
        self
    }

    pub fn with_query(mut self, query: QueryFilter) -> Self {
        self.query = query;
        self
    }
}

/// Routes declared by a method's `google.api.http` option
///
/// Methods without the option have no routes.
pub fn http_rules(method: &MethodDescriptor) -> Result<Vec<RouteSpec>, RegistrationError> {
    let Some(extension) = method.parent_pool().get_extension_by_name(HTTP_EXTENSION) else {
        return Ok(Vec::new());
    };
    let options = method.options();
    if !options.has_extension(&extension) {
        return Ok(Vec::new());
    }

    let operation = method.full_name().to_string();
    let rule = match options.get_extension(&extension).as_ref() {
        Value::Message(rule) => HttpRule::decode(rule.encode_to_vec().as_slice()).map_err(|e| {
            RegistrationError::InvalidRule {
                operation: operation.clone(),
                reason: e.to_string(),
            }
        })?,
        _ => {
            return Err(RegistrationError::InvalidRule {
                operation,
                reason: "option is not a message".to_string(),
            })
        }
    };

    let mut specs = vec![route_spec(&operation, &rule)?];
    for additional in &rule.additional_bindings {
        specs.push(route_spec(&operation, additional)?);
    }
    Ok(specs)
}

fn route_spec(operation: &str, rule: &HttpRule) -> Result<RouteSpec, RegistrationError> {
    let (method, template) = match &rule.pattern {
        Some(Pattern::Get(path)) => (Method::GET, path.clone()),
        Some(Pattern::Put(path)) => (Method::PUT, path.clone()),
        Some(Pattern::Post(path)) => (Method::POST, path.clone()),
        Some(Pattern::Delete(path)) => (Method::DELETE, path.clone()),
        Some(Pattern::Patch(path)) => (Method::PATCH, path.clone()),
        Some(Pattern::Custom(custom)) => {
            let method = Method::from_bytes(custom.kind.as_bytes()).map_err(|_| {
                RegistrationError::InvalidMethod {
                    operation: operation.to_string(),
                    method: custom.kind.clone(),
                }
            })?;
            (method, custom.path.clone())
        }
        None => {
            return Err(RegistrationError::InvalidRule {
                operation: operation.to_string(),
                reason: "no HTTP method pattern".to_string(),
            })
        }
    };
    Ok(RouteSpec::new(method, template)
        .with_body(rule.body.clone())
        .with_response_body(rule.response_body.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_proto::IDP_SERVICE;

    fn method(name: &str) -> MethodDescriptor {
        gantry_proto::descriptor_pool()
            .unwrap()
            .get_service_by_name(IDP_SERVICE)
            .unwrap()
            .methods()
            .find(|m| m.name() == name)
            .unwrap()
    }

    #[test]
    fn test_simple_rule() {
        let specs = http_rules(&method("GetIdp")).unwrap();
        assert_eq!(specs, vec![RouteSpec::get("/auth/v3/sso/idp/{metadata.name}")]);
    }

    #[test]
    fn test_body_rule() {
        let specs = http_rules(&method("CreateIdp")).unwrap();
        assert_eq!(specs, vec![RouteSpec::post("/auth/v3/sso/idp").with_body("*")]);
    }

    #[test]
    fn test_additional_bindings() {
        let specs = http_rules(&method("UpdateIdp")).unwrap();
        assert_eq!(
            specs,
            vec![
                RouteSpec::put("/auth/v3/sso/idp/{metadata.name}").with_body("*"),
                RouteSpec::patch("/auth/v3/sso/idp/{metadata.name}/spec").with_body("spec"),
            ]
        );
    }

    #[test]
    fn test_verb_route() {
        let specs = http_rules(&method("WatchIdps")).unwrap();
        assert_eq!(specs[0].template, "/auth/v3/sso/idp:watch");
    }

    #[test]
    fn test_builder_ignores_empty_selectors() {
        let spec = RouteSpec::get("/v1/x").with_body("").with_response_body("");
        assert_eq!(spec.body, None);
        assert_eq!(spec.response_body, None);
    }

    #[test]
    fn test_custom_pattern() {
        let rule = HttpRule {
            pattern: Some(Pattern::Custom(gantry_proto::google::api::CustomHttpPattern {
                kind: "OPTIONS".to_string(),
                path: "/v1/idp".to_string(),
            })),
            ..Default::default()
        };
        let spec = route_spec("x.Y/Z", &rule).unwrap();
        assert_eq!(spec.method, Method::OPTIONS);

        let rule = HttpRule {
            pattern: Some(Pattern::Custom(gantry_proto::google::api::CustomHttpPattern {
                kind: "NOT A METHOD".to_string(),
                path: "/v1/idp".to_string(),
            })),
            ..Default::default()
        };
        assert!(matches!(
            route_spec("x.Y/Z", &rule),
            Err(RegistrationError::InvalidMethod { .. })
        ));
    }
}
