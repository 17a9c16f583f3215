//! Weather lookup plugin.
//!
//! Conditions are synthesized deterministically from the location name, so
//! the plugin works offline and tests are reproducible. Swap the handler
//! for a real forecast client without touching the descriptor.

use async_trait::async_trait;

use aria_core::types::Tier;

use crate::types::{
    FunctionSchema, ParamKind, ParamSpec, PluginCall, PluginDescriptor, PluginHandler,
    ToolOutcome,
};

pub const PLUGIN_NAME: &str = "weather";
pub const FN_GET_WEATHER: &str = "get_weather";

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        name: PLUGIN_NAME.to_string(),
        version: "1.0.0".to_string(),
        description: "Current weather conditions for a named location".to_string(),
        tier_required: Tier::Free,
        default_enabled: true,
        functions: vec![FunctionSchema {
            name: FN_GET_WEATHER.to_string(),
            description: "Get the current weather for a city or place name".to_string(),
            parameters: vec![
                ParamSpec {
                    name: "location".to_string(),
                    kind: ParamKind::String,
                    description: "City or place name, e.g. \"Warsaw\"".to_string(),
                    required: true,
                },
                ParamSpec {
                    name: "unit".to_string(),
                    kind: ParamKind::String,
                    description: "\"celsius\" (default) or \"fahrenheit\"".to_string(),
                    required: false,
                },
            ],
        }],
    }
}

pub struct WeatherHandler;

#[async_trait]
impl PluginHandler for WeatherHandler {
    async fn call(&self, call: PluginCall) -> Result<ToolOutcome, String> {
        if call.function != FN_GET_WEATHER {
            return Err(format!("unknown function: {}", call.function));
        }
        let location = call
            .args
            .get("location")
            .and_then(|v| v.as_str())
            .ok_or("location missing")?;
        let fahrenheit = call
            .args
            .get("unit")
            .and_then(|v| v.as_str())
            .map(|u| u.eq_ignore_ascii_case("fahrenheit"))
            .unwrap_or(false);

        let (celsius, sky) = conditions_for(location);
        let (temp, unit) = if fahrenheit {
            (celsius * 9 / 5 + 32, "°F")
        } else {
            (celsius, "°C")
        };

        let summary = format!("{location}: {temp}{unit}, {sky}");
        Ok(ToolOutcome::success(summary).with_artifacts(serde_json::json!({
            "location": location,
            "temperature": temp,
            "unit": unit,
            "conditions": sky,
        })))
    }
}

/// Stable pseudo-conditions keyed on the location string.
fn conditions_for(location: &str) -> (i32, &'static str) {
    let seed: u32 = location
        .to_lowercase()
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    let celsius = (seed % 35) as i32 - 5;
    let sky = match seed % 4 {
        0 => "clear skies",
        1 => "partly cloudy",
        2 => "light rain",
        _ => "overcast",
    };
    (celsius, sky)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn call(args: serde_json::Value) -> PluginCall {
        PluginCall {
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            function: FN_GET_WEATHER.to_string(),
            args,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn reports_weather_for_location() {
        let outcome = WeatherHandler
            .call(call(serde_json::json!({ "location": "Warsaw" })))
            .await
            .unwrap();
        assert!(outcome.ok);
        assert!(outcome.content.contains("Warsaw"));
        let artifacts = outcome.artifacts.unwrap();
        assert_eq!(artifacts["location"], "Warsaw");
    }

    #[tokio::test]
    async fn same_location_is_deterministic() {
        let a = WeatherHandler
            .call(call(serde_json::json!({ "location": "Warsaw" })))
            .await
            .unwrap();
        let b = WeatherHandler
            .call(call(serde_json::json!({ "location": "Warsaw" })))
            .await
            .unwrap();
        assert_eq!(a.content, b.content);
    }

    #[tokio::test]
    async fn fahrenheit_unit_is_honored() {
        let outcome = WeatherHandler
            .call(call(
                serde_json::json!({ "location": "Warsaw", "unit": "fahrenheit" }),
            ))
            .await
            .unwrap();
        assert!(outcome.content.contains("°F"));
    }
}
