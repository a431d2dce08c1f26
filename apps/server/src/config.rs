use anyhow::{anyhow, Context};
use chrono::FixedOffset;
use std::time::Duration;
use url::Url;

use crate::schedule::{MinAdvancePolicy, SchedulePolicy, SlotFit};

const DEFAULT_DATABASE_URL: &str = "sqlite:booking.db?mode=rwc";
const DEFAULT_SITE_URL: &str = "http://localhost:5173";

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub admin_api_token: String,
    pub site_url: Url,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_currency: String,
    pub calendar_api_url: Option<Url>,
    pub calendar_api_key: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub tz_offset: FixedOffset,
    pub policy: SchedulePolicy,
    pub http_timeout: Duration,
    pub office_location: String,
    pub pending_payment_ttl: chrono::Duration,
    pub session_ttl: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let admin_api_token = get("ADMIN_API_TOKEN").context("ADMIN_API_TOKEN must be set")?;

        let site_url = get("SITE_URL").unwrap_or_else(|| DEFAULT_SITE_URL.into());
        let site_url = Url::parse(&site_url).context("SITE_URL must be a valid URL")?;

        let calendar_api_url = get("CALENDAR_API_URL")
            .map(|raw| Url::parse(&raw).context("CALENDAR_API_URL must be a valid URL"))
            .transpose()?;

        let tz_minutes: i32 = parse_or(&get, "TZ_OFFSET_MINUTES", 60)?;
        let tz_offset = FixedOffset::east_opt(tz_minutes * 60)
            .ok_or_else(|| anyhow!("TZ_OFFSET_MINUTES out of range: {tz_minutes}"))?;

        let slot_fit = match get("SLOT_FIT").as_deref() {
            None | Some("start_before_close") => SlotFit::StartBeforeClose,
            Some("end_before_close") => SlotFit::EndBeforeClose,
            Some(other) => return Err(anyhow!("unknown SLOT_FIT '{other}'")),
        };
        let min_advance = match get("MIN_ADVANCE_POLICY").as_deref() {
            None | Some("enforce_hours") => MinAdvancePolicy::EnforceHours,
            Some("date_only") => MinAdvancePolicy::DateOnly,
            Some(other) => return Err(anyhow!("unknown MIN_ADVANCE_POLICY '{other}'")),
        };

        let http_timeout_secs: u64 = parse_or(&get, "HTTP_TIMEOUT_SECS", 15)?;
        let pending_minutes: i64 = parse_or(&get, "PENDING_PAYMENT_TTL_MINUTES", 60)?;
        let session_minutes: u64 = parse_or(&get, "SESSION_TTL_MINUTES", 60)?;

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.into()),
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "PORT", 3000)?,
            admin_api_token,
            site_url,
            stripe_secret_key: get("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: get("STRIPE_WEBHOOK_SECRET"),
            stripe_currency: get("STRIPE_CURRENCY")
                .unwrap_or_else(|| "eur".into())
                .to_lowercase(),
            calendar_api_url,
            calendar_api_key: get("CALENDAR_API_KEY"),
            alert_webhook_url: get("ALERT_WEBHOOK_URL"),
            tz_offset,
            policy: SchedulePolicy {
                slot_fit,
                min_advance,
            },
            http_timeout: Duration::from_secs(http_timeout_secs),
            office_location: get("OFFICE_LOCATION").unwrap_or_else(|| "Office".into()),
            pending_payment_ttl: chrono::Duration::minutes(pending_minutes),
            session_ttl: Duration::from_secs(session_minutes * 60),
        })
    }

    /// Origin string for the CORS whitelist (no trailing slash).
    pub fn site_origin(&self) -> String {
        self.site_url.origin().ascii_serialization()
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{key} is invalid ('{raw}'): {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("ADMIN_API_TOKEN", "secret")])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.port, 3000);
        assert_eq!(config.tz_offset, FixedOffset::east_opt(3600).unwrap());
        assert_eq!(config.policy, SchedulePolicy::default());
        assert_eq!(config.http_timeout, Duration::from_secs(15));
        assert_eq!(config.stripe_currency, "eur");
        assert!(config.stripe_secret_key.is_none());
        assert!(config.calendar_api_url.is_none());
        assert_eq!(config.site_origin(), "http://localhost:5173");
    }

    #[test]
    fn test_admin_token_required() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[("ADMIN_API_TOKEN", "  ")])).is_err());
    }

    #[test]
    fn test_policies_and_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("ADMIN_API_TOKEN", "secret"),
            ("SLOT_FIT", "end_before_close"),
            ("MIN_ADVANCE_POLICY", "date_only"),
            ("TZ_OFFSET_MINUTES", "-300"),
            ("STRIPE_CURRENCY", "CHF"),
            ("SITE_URL", "https://consulting.example/"),
        ]))
        .unwrap();
        assert_eq!(config.policy.slot_fit, SlotFit::EndBeforeClose);
        assert_eq!(config.policy.min_advance, MinAdvancePolicy::DateOnly);
        assert_eq!(config.tz_offset, FixedOffset::west_opt(5 * 3600).unwrap());
        assert_eq!(config.stripe_currency, "chf");
        assert_eq!(config.site_origin(), "https://consulting.example");
    }

    #[test]
    fn test_invalid_values_rejected() {
        for (key, value) in [
            ("SLOT_FIT", "sometimes"),
            ("PORT", "http"),
            ("SITE_URL", "not a url"),
            ("TZ_OFFSET_MINUTES", "100000"),
        ] {
            let result = Config::from_lookup(lookup(&[("ADMIN_API_TOKEN", "secret"), (key, value)]));
            assert!(result.is_err(), "{key}={value} should fail");
        }
    }
}
