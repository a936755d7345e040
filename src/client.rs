//! Client adapters describe how to reach one third-party API.
//!
//! The gate never builds provider requests itself. It asks the registered
//! [`Client`] for a [`RequestSpec`] and, for metered APIs, for the credit cost of
//! the call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::{
    credits::{CreditTable, ScrapeOptions},
    error::{GateError, Result},
    fingerprint::canonical_value,
};

/// Request parameters as passed by callers
pub type Params = BTreeMap<String, Value>;

/// HTTP methods supported by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Whether params travel in the query string rather than the body
    pub fn uses_query(self) -> bool {
        matches!(self, Method::Get | Method::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(GateError::Validation(format!("Unsupported HTTP method: {}", other))),
        }
    }
}

/// A fully built outbound request, ready for a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

/// Adapter for a single third-party API
pub trait Client: Send + Sync {
    fn name(&self) -> &str;

    fn base_url(&self) -> &str;

    fn version(&self) -> &str;

    /// Opaque authentication parameters merged into every request
    fn auth_params(&self) -> BTreeMap<String, String>;

    /// Build the provider request. Invalid parameter combinations fail here,
    /// before anything is dispatched.
    fn build_request(&self, endpoint: &str, params: &Params, method: Method) -> Result<RequestSpec>;

    /// Metered cost of a call, if the provider bills per request
    fn cost(&self, _endpoint: &str, _params: &Params) -> Result<Option<f64>> {
        Ok(None)
    }
}

/// Generic REST adapter.
///
/// GET and DELETE params go in the query string, everything else is sent as a
/// JSON body. Auth params always go in the query string. With a credit table
/// attached, params are read as [`ScrapeOptions`] for validation and pricing.
#[derive(Debug, Clone)]
pub struct BasicClient {
    name: String,
    base_url: String,
    version: String,
    auth_params: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    credit_table: Option<CreditTable>,
}

impl BasicClient {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            version: version.into(),
            auth_params: BTreeMap::new(),
            headers: BTreeMap::new(),
            credit_table: None,
        }
    }

    pub fn with_auth_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_params.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_credit_table(mut self, table: CreditTable) -> Self {
        self.credit_table = Some(table);
        self
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

impl Client for BasicClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn auth_params(&self) -> BTreeMap<String, String> {
        self.auth_params.clone()
    }

    fn build_request(&self, endpoint: &str, params: &Params, method: Method) -> Result<RequestSpec> {
        if self.credit_table.is_some() {
            ScrapeOptions::from_params(params)?.validate()?;
        }

        let mut query: Vec<(String, String)> = self
            .auth_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut headers = self.headers.clone();
        let mut body = None;

        if method.uses_query() {
            query.extend(
                params
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), canonical_value(v))),
            );
        } else {
            let payload: serde_json::Map<String, Value> = params
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            body = Some(serde_json::to_vec(&payload)?);
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| "application/json".to_string());
        }

        Ok(RequestSpec {
            method,
            url: self.endpoint_url(endpoint),
            query,
            headers,
            body,
        })
    }

    fn cost(&self, _endpoint: &str, params: &Params) -> Result<Option<f64>> {
        match &self.credit_table {
            Some(table) => Ok(Some(ScrapeOptions::from_params(params)?.credits(table)?)),
            None => Ok(None),
        }
    }
}
