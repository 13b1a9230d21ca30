use crate::core::config::GeolocationConfig;
use crate::core::Storage;
use crate::errors::{EngineError, Result};
use crate::services::GeolocationProvider;
use crate::types::Geolocation;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const GEOLOCATION_CACHE_KEY: &str = "pageflow_geolocation";

/// Two-provider IP geolocation lookup: ipapi.co style first, ip-api.com
/// style as the fallback.
#[derive(Debug, Clone)]
pub struct HttpGeolocationProvider {
    client: Client,
    primary_url: String,
    fallback_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PrimaryResponse {
    error: bool,
    reason: Option<String>,
    country_name: String,
    country_code: String,
    region: String,
    city: String,
    timezone: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    org: String,
    version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FallbackResponse {
    status: String,
    message: Option<String>,
    country: String,
    country_code: String,
    region_name: String,
    city: String,
    timezone: String,
    lat: Option<f64>,
    lon: Option<f64>,
    isp: String,
    mobile: bool,
    proxy: bool,
    hosting: bool,
}

impl From<PrimaryResponse> for Geolocation {
    fn from(r: PrimaryResponse) -> Self {
        Geolocation {
            country: r.country_name,
            country_code: r.country_code,
            region: r.region,
            city: r.city,
            timezone: r.timezone,
            latitude: r.latitude,
            longitude: r.longitude,
            isp: r.org,
            ip_type: r.version,
        }
    }
}

impl From<FallbackResponse> for Geolocation {
    fn from(r: FallbackResponse) -> Self {
        let ip_type = if r.mobile {
            "mobile"
        } else if r.proxy {
            "proxy"
        } else if r.hosting {
            "hosting"
        } else {
            "residential"
        };
        Geolocation {
            country: r.country,
            country_code: r.country_code,
            region: r.region_name,
            city: r.city,
            timezone: r.timezone,
            latitude: r.lat,
            longitude: r.lon,
            isp: r.isp,
            ip_type: ip_type.to_string(),
        }
    }
}

impl HttpGeolocationProvider {
    pub fn new(config: &GeolocationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            primary_url: config.primary_url.clone(),
            fallback_url: config.fallback_url.clone(),
        })
    }

    async fn primary(&self) -> Result<Geolocation> {
        let body: PrimaryResponse = self.client.get(&self.primary_url).send().await?.json().await?;
        if body.error {
            return Err(EngineError::GeolocationFailed(
                body.reason.unwrap_or_else(|| "primary provider error".to_string()),
            ));
        }
        Ok(body.into())
    }

    async fn fallback(&self) -> Result<Geolocation> {
        let body: FallbackResponse = self.client.get(&self.fallback_url).send().await?.json().await?;
        if body.status != "success" {
            return Err(EngineError::GeolocationFailed(
                body.message.unwrap_or_else(|| "fallback provider error".to_string()),
            ));
        }
        Ok(body.into())
    }
}

#[async_trait]
impl GeolocationProvider for HttpGeolocationProvider {
    async fn locate(&self) -> Result<Geolocation> {
        match self.primary().await {
            Ok(geo) => Ok(geo),
            Err(e) => {
                warn!("Primary geolocation provider failed, trying fallback: {}", e);
                self.fallback().await
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedGeolocation {
    data: Geolocation,
    cached_at: DateTime<Utc>,
}

fn read_cache(storage: &dyn Storage, ttl_secs: i64) -> Option<Geolocation> {
    let raw = storage.get(GEOLOCATION_CACHE_KEY)?;
    let cached: CachedGeolocation = serde_json::from_str(&raw).ok()?;
    if Utc::now() - cached.cached_at < ChronoDuration::seconds(ttl_secs) {
        Some(cached.data)
    } else {
        storage.remove(GEOLOCATION_CACHE_KEY);
        None
    }
}

fn write_cache(storage: &dyn Storage, geolocation: &Geolocation) {
    let cached = CachedGeolocation {
        data: geolocation.clone(),
        cached_at: Utc::now(),
    };
    match serde_json::to_string(&cached) {
        Ok(raw) => storage.set(GEOLOCATION_CACHE_KEY, &raw),
        Err(e) => warn!("Failed to cache geolocation: {}", e),
    }
}

/// Cached lookup. Falls back to an empty location when every provider fails,
/// so geolocation triggers simply do not match.
pub async fn resolve_geolocation(
    storage: &dyn Storage,
    provider: &dyn GeolocationProvider,
    ttl_secs: i64,
) -> Geolocation {
    if let Some(cached) = read_cache(storage, ttl_secs) {
        debug!("Using cached geolocation");
        return cached;
    }

    match provider.locate().await {
        Ok(geolocation) => {
            write_cache(storage, &geolocation);
            geolocation
        }
        Err(e) => {
            warn!(transient = e.is_transient(), "Geolocation lookup failed: {}", e);
            Geolocation::default()
        }
    }
}
