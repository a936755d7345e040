//! Credit accounting for metered scraping APIs.
//!
//! Prices are data, not code: a [`CreditTable`] carries the provider's numbers
//! and [`ScrapeOptions::credits`] applies them. The default table matches the
//! common scraping-provider price list:
//!
//! | options                         | credits |
//! |---------------------------------|---------|
//! | none                            | 1       |
//! | dynamic rendering               | 5       |
//! | premium proxy                   | 10      |
//! | dynamic rendering + premium     | 25      |
//! | super proxy                     | 75      |
//! | AI extraction surcharge         | +5      |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    client::Params,
    error::{GateError, Result},
};

/// Provider price list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditTable {
    pub base: f64,
    pub dynamic_multiplier: f64,
    pub premium_multiplier: f64,
    /// Multiplier when dynamic rendering and premium proxy are combined
    pub dynamic_premium_multiplier: f64,
    pub super_proxy_flat_cost: f64,
    pub ai_surcharge: f64,
}

impl Default for CreditTable {
    fn default() -> Self {
        Self {
            base: 1.0,
            dynamic_multiplier: 5.0,
            premium_multiplier: 10.0,
            dynamic_premium_multiplier: 25.0,
            super_proxy_flat_cost: 75.0,
            ai_surcharge: 5.0,
        }
    }
}

/// Options of a single scrape call.
///
/// Replaces long positional parameter lists with named fields; `to_params`
/// produces the map handed to the gate and `from_params` reads it back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeOptions {
    pub url: Option<String>,
    pub dynamic_rendering: bool,
    pub premium_proxy: bool,
    pub super_proxy: bool,
    pub country_code: Option<String>,
    pub wait_ms: Option<u64>,
    pub ai_query: Option<String>,
    pub ai_extract_rules: Option<Value>,
}

impl ScrapeOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn dynamic_rendering(mut self, enabled: bool) -> Self {
        self.dynamic_rendering = enabled;
        self
    }

    pub fn premium_proxy(mut self, enabled: bool) -> Self {
        self.premium_proxy = enabled;
        self
    }

    pub fn super_proxy(mut self, enabled: bool) -> Self {
        self.super_proxy = enabled;
        self
    }

    pub fn ai_query(mut self, query: impl Into<String>) -> Self {
        self.ai_query = Some(query.into());
        self
    }

    pub fn ai_extract_rules(mut self, rules: Value) -> Self {
        self.ai_extract_rules = Some(rules);
        self
    }

    pub fn uses_ai(&self) -> bool {
        self.ai_query.as_deref().is_some_and(|q| !q.is_empty()) || self.ai_extract_rules.is_some()
    }

    /// Reject option combinations the provider refuses
    pub fn validate(&self) -> Result<()> {
        if self.super_proxy && (self.dynamic_rendering || self.premium_proxy) {
            return Err(GateError::Validation(
                "super_proxy cannot be combined with dynamic_rendering or premium_proxy".to_string(),
            ));
        }
        Ok(())
    }

    /// Credits this call costs under `table`.
    ///
    /// Super proxy is a flat price; the AI surcharge is not added on top of it.
    pub fn credits(&self, table: &CreditTable) -> Result<f64> {
        self.validate()?;

        if self.super_proxy {
            return Ok(table.super_proxy_flat_cost);
        }

        let multiplier = match (self.dynamic_rendering, self.premium_proxy) {
            (true, true) => table.dynamic_premium_multiplier,
            (true, false) => table.dynamic_multiplier,
            (false, true) => table.premium_multiplier,
            (false, false) => 1.0,
        };

        let mut cost = table.base * multiplier;
        if self.uses_ai() {
            cost += table.ai_surcharge;
        }
        Ok(cost)
    }

    /// Parameter map for the gate. Disabled flags and unset options are omitted.
    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        if let Some(url) = &self.url {
            params.insert("url".to_string(), Value::String(url.clone()));
        }
        for (key, enabled) in [
            ("dynamic_rendering", self.dynamic_rendering),
            ("premium_proxy", self.premium_proxy),
            ("super_proxy", self.super_proxy),
        ] {
            if enabled {
                params.insert(key.to_string(), Value::Bool(true));
            }
        }
        if let Some(country) = &self.country_code {
            params.insert("country_code".to_string(), Value::String(country.clone()));
        }
        if let Some(wait) = self.wait_ms {
            params.insert("wait_ms".to_string(), Value::from(wait));
        }
        if let Some(query) = &self.ai_query {
            params.insert("ai_query".to_string(), Value::String(query.clone()));
        }
        if let Some(rules) = &self.ai_extract_rules {
            params.insert("ai_extract_rules".to_string(), rules.clone());
        }
        params
    }

    /// Read options from a loosely typed parameter map.
    ///
    /// Flags accept booleans, `"true"`/`"1"` strings and `1`.
    pub fn from_params(params: &Params) -> Result<Self> {
        let wait_ms = match params.get("wait_ms") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.as_u64().ok_or_else(|| {
                GateError::Validation(format!("wait_ms must be a non-negative integer, got {}", n))
            })?),
            Some(Value::String(s)) => Some(s.parse::<u64>().map_err(|_| {
                GateError::Validation(format!("wait_ms must be a non-negative integer, got {:?}", s))
            })?),
            Some(other) => {
                return Err(GateError::Validation(format!(
                    "wait_ms must be a non-negative integer, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            url: string_param(params, "url"),
            dynamic_rendering: flag_param(params, "dynamic_rendering"),
            premium_proxy: flag_param(params, "premium_proxy"),
            super_proxy: flag_param(params, "super_proxy"),
            country_code: string_param(params, "country_code"),
            wait_ms,
            ai_query: string_param(params, "ai_query"),
            ai_extract_rules: params.get("ai_extract_rules").filter(|v| !v.is_null()).cloned(),
        })
    }
}

fn flag_param(params: &Params, key: &str) -> bool {
    match params.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn string_param(params: &Params, key: &str) -> Option<String> {
    match params.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cost(options: ScrapeOptions) -> f64 {
        options.credits(&CreditTable::default()).unwrap()
    }

    #[test]
    fn test_credit_table_fixture() {
        let plain = ScrapeOptions::new("https://example.org");

        assert_eq!(cost(plain.clone()), 1.0);
        assert_eq!(cost(plain.clone().dynamic_rendering(true)), 5.0);
        assert_eq!(cost(plain.clone().premium_proxy(true)), 10.0);
        assert_eq!(cost(plain.clone().dynamic_rendering(true).premium_proxy(true)), 25.0);
        assert_eq!(cost(plain.clone().super_proxy(true)), 75.0);
        assert_eq!(cost(plain.clone().ai_query("price of item")), 6.0);
        assert_eq!(
            cost(plain.clone().dynamic_rendering(true).premium_proxy(true).ai_query("title")),
            30.0
        );
        assert_eq!(cost(plain.ai_extract_rules(json!({"title": "h1"}))), 6.0);
    }

    #[test]
    fn test_super_proxy_combinations_are_invalid() {
        let table = CreditTable::default();
        let with_dynamic = ScrapeOptions::new("u").super_proxy(true).dynamic_rendering(true);
        let with_premium = ScrapeOptions::new("u").super_proxy(true).premium_proxy(true);

        assert!(matches!(with_dynamic.credits(&table), Err(GateError::Validation(_))));
        assert!(matches!(with_premium.validate(), Err(GateError::Validation(_))));
    }

    #[test]
    fn test_super_proxy_ignores_ai_surcharge() {
        let options = ScrapeOptions::new("u").super_proxy(true).ai_query("summary");
        assert_eq!(cost(options), 75.0);
    }

    #[test]
    fn test_custom_table() {
        let table = CreditTable {
            base: 2.0,
            ai_surcharge: 1.5,
            ..Default::default()
        };
        let options = ScrapeOptions::new("u").dynamic_rendering(true).ai_query("q");
        assert_eq!(options.credits(&table).unwrap(), 11.5);
    }

    #[test]
    fn test_params_round_trip() {
        let options = ScrapeOptions {
            url: Some("https://example.org".to_string()),
            premium_proxy: true,
            country_code: Some("de".to_string()),
            wait_ms: Some(1500),
            ai_query: Some("headline".to_string()),
            ..Default::default()
        };

        let params = options.to_params();
        assert!(!params.contains_key("dynamic_rendering"));
        assert_eq!(ScrapeOptions::from_params(&params).unwrap(), options);
    }

    #[test]
    fn test_from_params_accepts_loose_flags() {
        let params: Params = [
            ("dynamic_rendering".to_string(), json!("true")),
            ("premium_proxy".to_string(), json!(1)),
            ("wait_ms".to_string(), json!("250")),
        ]
        .into_iter()
        .collect();

        let options = ScrapeOptions::from_params(&params).unwrap();
        assert!(options.dynamic_rendering);
        assert!(options.premium_proxy);
        assert_eq!(options.wait_ms, Some(250));

        let bad: Params = [("wait_ms".to_string(), json!("soon"))].into_iter().collect();
        assert!(matches!(ScrapeOptions::from_params(&bad), Err(GateError::Validation(_))));
    }

    #[test]
    fn test_wait_ms_rejects_non_integer_numbers() {
        for value in [json!(-5), json!(2.5)] {
            let params: Params = [("wait_ms".to_string(), value)].into_iter().collect();
            assert!(matches!(
                ScrapeOptions::from_params(&params),
                Err(GateError::Validation(_))
            ));
        }

        let whole: Params = [("wait_ms".to_string(), json!(400))].into_iter().collect();
        assert_eq!(ScrapeOptions::from_params(&whole).unwrap().wait_ms, Some(400));
    }

    #[test]
    fn test_table_from_yaml_uses_defaults() {
        let table: CreditTable = serde_yaml::from_str("ai_surcharge: 3\n").unwrap();
        assert_eq!(table.ai_surcharge, 3.0);
        assert_eq!(table.super_proxy_flat_cost, 75.0);
    }
}
