//! Action catalog: which brokerage call an action name maps to, and whether
//! it changes anything.

use crate::error::{GateError, GateResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Read,
    /// Needs human approval
    Mutate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One catalog entry, configurable under `[[broker.actions]]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRoute {
    pub name: String,
    pub method: HttpMethod,
    /// Path below the API base URL; `{param}` segments are filled from the action parameters
    pub path: String,
    pub effect: Effect,
    /// Parameter sent as the JSON request body
    #[serde(default)]
    pub body_param: Option<String>,
    /// Parameters passed through as query string values when present
    #[serde(default)]
    pub query_params: Vec<String>,
}

/// A fully resolved brokerage request
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerageCall {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl ActionRoute {
    fn new(name: &str, method: HttpMethod, path: &str, effect: Effect) -> Self {
        Self {
            name: name.to_string(),
            method,
            path: path.to_string(),
            effect,
            body_param: None,
            query_params: Vec::new(),
        }
    }

    fn with_body(mut self, param: &str) -> Self {
        self.body_param = Some(param.to_string());
        self
    }

    fn with_query(mut self, params: &[&str]) -> Self {
        self.query_params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Resolve the route against caller parameters. Path values are
    /// percent-encoded so a parameter can never add path segments.
    pub fn build_call(&self, params: &Value) -> GateResult<BrokerageCall> {
        let empty = serde_json::Map::new();
        let params = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(GateError::InvalidRequest(
                    "action params must be a JSON object".to_string(),
                ))
            }
        };

        let mut path = String::with_capacity(self.path.len());
        let mut rest = self.path.as_str();
        while let Some(start) = rest.find('{') {
            let end = rest[start..]
                .find('}')
                .map(|i| start + i)
                .ok_or_else(|| GateError::Internal(anyhow::anyhow!("Unclosed placeholder in route {}", self.name)))?;
            let key = &rest[start + 1..end];
            let value = params.get(key).and_then(scalar).filter(|v| !v.is_empty()).ok_or_else(|| {
                GateError::InvalidRequest(format!("{} requires parameter {}", self.name, key))
            })?;

            path.push_str(&rest[..start]);
            path.push_str(&urlencoding::encode(&value));
            rest = &rest[end + 1..];
        }
        path.push_str(rest);

        let mut query = Vec::new();
        for key in &self.query_params {
            match params.get(key) {
                Some(Value::Array(items)) => {
                    for item in items {
                        if let Some(v) = scalar(item) {
                            query.push((key.clone(), v));
                        }
                    }
                }
                Some(value) => {
                    if let Some(v) = scalar(value) {
                        query.push((key.clone(), v));
                    }
                }
                None => {}
            }
        }

        let body = match &self.body_param {
            Some(key) => Some(params.get(key).cloned().ok_or_else(|| {
                GateError::InvalidRequest(format!("{} requires parameter {}", self.name, key))
            })?),
            None => None,
        };

        Ok(BrokerageCall {
            method: self.method,
            path,
            query,
            body,
        })
    }
}

/// Routes for a Schwab-style trader API.
pub fn default_action_catalog() -> Vec<ActionRoute> {
    use Effect::{Mutate, Read};
    use HttpMethod::{Delete, Get, Post, Put};

    vec![
        ActionRoute::new("get_account_numbers", Get, "/trader/v1/accounts/accountNumbers", Read),
        ActionRoute::new("get_accounts", Get, "/trader/v1/accounts", Read).with_query(&["fields"]),
        ActionRoute::new("get_account", Get, "/trader/v1/accounts/{account_hash}", Read)
            .with_query(&["fields"]),
        ActionRoute::new("get_orders", Get, "/trader/v1/accounts/{account_hash}/orders", Read)
            .with_query(&["maxResults", "fromEnteredTime", "toEnteredTime", "status"]),
        ActionRoute::new(
            "get_order",
            Get,
            "/trader/v1/accounts/{account_hash}/orders/{order_id}",
            Read,
        ),
        ActionRoute::new("place_order", Post, "/trader/v1/accounts/{account_hash}/orders", Mutate)
            .with_body("order"),
        ActionRoute::new(
            "replace_order",
            Put,
            "/trader/v1/accounts/{account_hash}/orders/{order_id}",
            Mutate,
        )
        .with_body("order"),
        ActionRoute::new(
            "cancel_order",
            Delete,
            "/trader/v1/accounts/{account_hash}/orders/{order_id}",
            Mutate,
        ),
    ]
}

/// Name-indexed catalog
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    routes: HashMap<String, ActionRoute>,
}

impl ActionCatalog {
    pub fn new(routes: Vec<ActionRoute>) -> Self {
        Self {
            routes: routes.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ActionRoute> {
        self.routes.get(name)
    }

    /// Sorted by name
    pub fn routes(&self) -> Vec<&ActionRoute> {
        let mut routes: Vec<_> = self.routes.values().collect();
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> ActionCatalog {
        ActionCatalog::new(default_action_catalog())
    }

    #[test]
    fn test_path_parameters_are_encoded() {
        let route = catalog().get("cancel_order").cloned().unwrap();
        let call = route
            .build_call(&json!({"account_hash": "ABC/../x", "order_id": 42}))
            .unwrap();

        assert_eq!(call.method, HttpMethod::Delete);
        assert_eq!(call.path, "/trader/v1/accounts/ABC%2F..%2Fx/orders/42");
        assert!(call.body.is_none());
    }

    #[test]
    fn test_missing_path_parameter() {
        let route = catalog().get("get_account").cloned().unwrap();
        assert!(matches!(
            route.build_call(&json!({})),
            Err(GateError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_body_and_query() {
        let catalog = catalog();

        let place = catalog.get("place_order").unwrap();
        let order = json!({"orderType": "LIMIT", "price": "1.00"});
        let call = place
            .build_call(&json!({"account_hash": "H", "order": order}))
            .unwrap();
        assert_eq!(call.body, Some(order));

        let orders = catalog.get("get_orders").unwrap();
        let call = orders
            .build_call(&json!({"account_hash": "H", "maxResults": 10, "status": ["WORKING", "FILLED"]}))
            .unwrap();
        assert_eq!(
            call.query,
            vec![
                ("maxResults".to_string(), "10".to_string()),
                ("status".to_string(), "WORKING".to_string()),
                ("status".to_string(), "FILLED".to_string()),
            ]
        );
    }

    #[test]
    fn test_effects() {
        let catalog = catalog();
        for name in ["place_order", "replace_order", "cancel_order"] {
            assert_eq!(catalog.get(name).unwrap().effect, Effect::Mutate, "{}", name);
        }
        for name in ["get_accounts", "get_account", "get_orders", "get_order"] {
            assert_eq!(catalog.get(name).unwrap().effect, Effect::Read, "{}", name);
        }
    }

    #[test]
    fn test_catalog_from_toml() {
        let routes: Vec<ActionRoute> = toml::from_str::<toml::Value>(
            r#"
            [[actions]]
            name = "get_quotes"
            method = "GET"
            path = "/marketdata/v1/quotes"
            effect = "read"
            query_params = ["symbols"]
            "#,
        )
        .unwrap()["actions"]
            .clone()
            .try_into()
            .unwrap();

        assert_eq!(routes[0].method, HttpMethod::Get);
        assert_eq!(routes[0].effect, Effect::Read);
        assert!(routes[0].body_param.is_none());
    }
}
