//! The fixed set of upstream endpoints and their retry policies.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// National daily counts and global totals.
const QQ_URL: &str = "https://service-n9zsbooc-1252957949.gz.apigw.tencentcs.com/release/qq";
/// Per-province/per-city area statistics.
const DXY_URL: &str =
    "https://service-0gg71fu4-1252957949.gz.apigw.tencentcs.com/release/dingxiangyuan";
const PROVINCE_CITY_HISTORY_URL: &str = "http://ncov.nosensor.com:8080/api/";
const OVERALL_LATEST_URL: &str = "https://lab.isaaclin.cn/nCoV/api/overall?latest=1";
const OVERALL_HISTORY_URL: &str = "https://lab.isaaclin.cn/nCoV/api/overall?latest=0";
const AREA_LATEST_URL: &str = "https://lab.isaaclin.cn/nCoV/api/area?latest=1";
const AREA_HISTORY_URL: &str = "https://lab.isaaclin.cn/nCoV/api/area?latest=0";
const PROVINCE_DAILY_URL: &str = "https://api.inews.qq.com/newsqa/v1/query/pubished/daily/list";

/// Identifier of a registered upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointId {
    /// National daily counts array plus the global-totals object.
    Qq,
    /// Current area-stat array (provinces with nested cities).
    Dxy,
    /// Province/city daily history dump.
    ProvinceCityHistory,
    /// Latest national totals.
    OverallLatest,
    /// Every national-total observation, irregularly sampled.
    OverallHistory,
    /// Latest per-province records.
    AreaLatest,
    /// Every per-province observation, irregularly sampled.
    AreaHistory,
    /// Daily list for one province (and optionally one city).
    ProvinceDaily,
}

impl EndpointId {
    pub const ALL: [EndpointId; 8] = [
        EndpointId::Qq,
        EndpointId::Dxy,
        EndpointId::ProvinceCityHistory,
        EndpointId::OverallLatest,
        EndpointId::OverallHistory,
        EndpointId::AreaLatest,
        EndpointId::AreaHistory,
        EndpointId::ProvinceDaily,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointId::Qq => "qq",
            EndpointId::Dxy => "dxy",
            EndpointId::ProvinceCityHistory => "province_city_history",
            EndpointId::OverallLatest => "overall_latest",
            EndpointId::OverallHistory => "overall_history",
            EndpointId::AreaLatest => "area_latest",
            EndpointId::AreaHistory => "area_history",
            EndpointId::ProvinceDaily => "province_daily",
        }
    }

    /// JSON pointer to the record array inside the response document.
    ///
    /// `None` means the document itself is the array.
    pub fn records_pointer(&self) -> Option<&'static str> {
        match self {
            EndpointId::Qq => Some("/data/wuwei_ww_cn_day_counts"),
            EndpointId::Dxy => Some("/data/getAreaStat"),
            EndpointId::ProvinceCityHistory => None,
            EndpointId::OverallLatest
            | EndpointId::OverallHistory
            | EndpointId::AreaLatest
            | EndpointId::AreaHistory => Some("/results"),
            EndpointId::ProvinceDaily => Some("/data"),
        }
    }

    fn default_url(&self) -> &'static str {
        match self {
            EndpointId::Qq => QQ_URL,
            EndpointId::Dxy => DXY_URL,
            EndpointId::ProvinceCityHistory => PROVINCE_CITY_HISTORY_URL,
            EndpointId::OverallLatest => OVERALL_LATEST_URL,
            EndpointId::OverallHistory => OVERALL_HISTORY_URL,
            EndpointId::AreaLatest => AREA_LATEST_URL,
            EndpointId::AreaHistory => AREA_HISTORY_URL,
            EndpointId::ProvinceDaily => PROVINCE_DAILY_URL,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * self.multiplier.saturating_pow(attempt)
    }
}

/// URL and retry policy of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub url: String,
    pub retry: RetryPolicy,
}

/// The configured endpoint set.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    endpoints: HashMap<EndpointId, EndpointConfig>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry {
    /// Registry pointing at the public upstream APIs.
    pub fn new() -> Self {
        let endpoints = EndpointId::ALL
            .into_iter()
            .map(|id| {
                (
                    id,
                    EndpointConfig {
                        url: id.default_url().to_string(),
                        retry: RetryPolicy::default(),
                    },
                )
            })
            .collect();
        Self { endpoints }
    }

    /// Registry with every endpoint served under `{base_url}/{id}` (for testing).
    pub fn rooted_at(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let endpoints = EndpointId::ALL
            .into_iter()
            .map(|id| {
                (
                    id,
                    EndpointConfig {
                        url: format!("{}/{}", base, id.as_str()),
                        retry: RetryPolicy::default(),
                    },
                )
            })
            .collect();
        Self { endpoints }
    }

    pub fn with_retry(mut self, id: EndpointId, retry: RetryPolicy) -> Self {
        if let Some(cfg) = self.endpoints.get_mut(&id) {
            cfg.retry = retry;
        }
        self
    }

    /// Apply the same retry policy to every endpoint.
    pub fn with_retry_all(mut self, retry: RetryPolicy) -> Self {
        for cfg in self.endpoints.values_mut() {
            cfg.retry = retry;
        }
        self
    }

    pub fn get(&self, id: EndpointId) -> &EndpointConfig {
        // Every id is inserted at construction and never removed.
        &self.endpoints[&id]
    }

    /// URL of the per-province (or per-city) daily list.
    pub fn province_daily_url(&self, province: &str, city: Option<&str>) -> String {
        let base = &self.get(EndpointId::ProvinceDaily).url;
        let mut url = format!("{}?province={}", base, urlencoding::encode(province));
        if let Some(city) = city {
            url.push_str(&format!("&city={}", urlencoding::encode(city)));
        }
        url
    }
}
