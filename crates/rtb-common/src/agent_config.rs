//! Agent configuration: everything the router needs to decide whether an
//! agent wants a given bid request, and how to treat its bids afterwards.
//!
//! Configs are immutable once published into the registry; mutation is by
//! whole-record replacement. JSON round-trips must be structurally lossless
//! because agents resubmit configs they previously read back.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bid_request::{FoldPosition, Format, SegmentList};
use crate::ids::AccountKey;
use crate::money::Micros;

/// Why a configuration was rejected at publish time.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("agent has no creatives")]
    NoCreatives,

    #[error("creative {0} has a zero-area format")]
    ZeroAreaCreative(u32),

    #[error("duplicate creative id {0}")]
    DuplicateCreativeId(u32),

    #[error("bid probability {0} outside [0, 1]")]
    BadBidProbability(f64),

    #[error("max in-flight must be positive")]
    ZeroMaxInFlight,

    #[error("user partition modulus must be positive")]
    BadPartitionModulus,

    #[error("partition interval [{first}, {last}) outside [0, {modulus})")]
    BadPartitionInterval { first: u32, last: u32, modulus: u32 },

    #[error("hour-of-week bitmap must be 168 bits, got {0}")]
    BadHourBitmap(usize),

    #[error("fixed bid control without a positive price")]
    MissingFixedPrice,

    #[error("duplicate augmentation {0:?}")]
    DuplicateAugmentation(String),

    #[error("blacklist enabled with non-positive duration")]
    BadBlacklistDuration,
}

/// Generic include/exclude list over exact values.
///
/// Empty include means "everything"; exclude always wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncludeExclude<T: PartialEq> {
    pub include: Vec<T>,
    pub exclude: Vec<T>,
}

impl<T: PartialEq> Default for IncludeExclude<T> {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl<T: PartialEq> IncludeExclude<T> {
    pub fn accepts(&self, value: &T) -> bool {
        if self.exclude.contains(value) {
            return false;
        }
        self.include.is_empty() || self.include.contains(value)
    }

    /// True when the lists impose no constraint at all.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

impl IncludeExclude<String> {
    pub fn including<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: values.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    pub fn excluding<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: Vec::new(),
            exclude: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Include/exclude over regex patterns.
///
/// The patterns are stored here; compilation and per-request decision
/// caching happen in the router's filter pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternIncludeExclude {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl PatternIncludeExclude {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn including<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: patterns.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }
}

/// Domain-suffix matcher for host filtering.
///
/// `example.com` matches itself and any subdomain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostIncludeExclude {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

fn domain_matches(domain: &str, host: &str) -> bool {
    if let Some(prefix) = host.strip_suffix(domain) {
        prefix.is_empty() || prefix.ends_with('.')
    } else {
        false
    }
}

impl HostIncludeExclude {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn accepts(&self, host: &str) -> bool {
        if self.exclude.iter().any(|d| domain_matches(d, host)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|d| domain_matches(d, host))
    }

    pub fn including<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: domains.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }
}

/// Symbolic boolean expression over a tag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagFilter {
    /// A single tag must be present.
    Tag(String),
    /// All sub-expressions must match.
    All(Vec<TagFilter>),
    /// At least one sub-expression must match.
    Any(Vec<TagFilter>),
    /// The sub-expression must not match.
    Not(Box<TagFilter>),
}

impl TagFilter {
    pub fn matches(&self, tags: &SegmentList) -> bool {
        match self {
            TagFilter::Tag(tag) => tags.contains(tag),
            TagFilter::All(exprs) => exprs.iter().all(|e| e.matches(tags)),
            TagFilter::Any(exprs) => exprs.iter().any(|e| e.matches(tags)),
            TagFilter::Not(expr) => !expr.matches(tags),
        }
    }
}

/// How users are hashed for consistent A/B partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionHash {
    /// Hash is always zero.
    #[default]
    None,
    /// Fresh random value per evaluation.
    Random,
    /// `md5(exchange id) mod modulus`.
    ExchangeId,
    /// `md5(provider id) mod modulus`.
    ProviderId,
    /// `md5(ip ‖ user-agent) mod modulus`, no delimiter.
    Ipua,
}

/// Half-open accepted range `[first, last)` of partition hash values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInterval {
    pub first: u32,
    pub last: u32,
}

impl PartitionInterval {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, value: u32) -> bool {
        value >= self.first && value < self.last
    }
}

/// Consistent user partitioning for A/B testing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPartition {
    pub hash_on: PartitionHash,
    pub modulus: u32,
    pub include_ranges: Vec<PartitionInterval>,
}

impl Default for UserPartition {
    fn default() -> Self {
        Self {
            hash_on: PartitionHash::None,
            modulus: 1,
            include_ranges: vec![PartitionInterval::new(0, 1)],
        }
    }
}

impl UserPartition {
    /// True for the default partition that accepts everyone.
    pub fn is_empty(&self) -> bool {
        self.hash_on == PartitionHash::None
            && self.modulus == 1
            && self.include_ranges.len() == 1
            && self.include_ranges[0] == PartitionInterval::new(0, 1)
    }

    pub fn accepts_hash(&self, value: u32) -> bool {
        self.include_ranges.iter().any(|r| r.contains(value))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.modulus == 0 {
            return Err(ConfigError::BadPartitionModulus);
        }
        for r in &self.include_ranges {
            if r.first >= r.last || r.last > self.modulus {
                return Err(ConfigError::BadPartitionInterval {
                    first: r.first,
                    last: r.last,
                    modulus: self.modulus,
                });
            }
        }
        Ok(())
    }
}

/// Per-taxonomy segment targeting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentFilter {
    /// Reject the request outright when the taxonomy is absent from it.
    pub exclude_if_not_present: bool,
    pub include: SegmentList,
    pub exclude: SegmentList,
    /// Exchanges this filter applies to; elsewhere it is bypassed.
    pub apply_to_exchanges: IncludeExclude<String>,
}

/// Outcome of evaluating a [`SegmentFilter`] against request segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMatch {
    Accept,
    /// Taxonomy absent and `exclude_if_not_present` set.
    MissingTaxonomy,
    Excluded,
    NotIncluded,
}

impl SegmentFilter {
    pub fn evaluate(&self, segments: Option<&SegmentList>) -> SegmentMatch {
        let Some(segments) = segments else {
            return if self.exclude_if_not_present {
                SegmentMatch::MissingTaxonomy
            } else {
                SegmentMatch::Accept
            };
        };
        if self.exclude.intersects(segments) {
            return SegmentMatch::Excluded;
        }
        if !self.include.is_empty() && !self.include.intersects(segments) {
            return SegmentMatch::NotIncluded;
        }
        SegmentMatch::Accept
    }
}

/// Bitmap over the 168 hours of a week, Sunday 00:00 UTC first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourOfWeekFilter {
    bits: [u64; 3],
}

impl Default for HourOfWeekFilter {
    fn default() -> Self {
        Self::all_hours()
    }
}

impl HourOfWeekFilter {
    pub const HOURS: usize = 168;

    /// Accepts every hour.
    pub fn all_hours() -> Self {
        let mut bits = [u64::MAX; 3];
        // Clear the 24 unused high bits of the last word.
        bits[2] = (1u64 << (Self::HOURS - 128)) - 1;
        Self { bits }
    }

    pub fn no_hours() -> Self {
        Self { bits: [0; 3] }
    }

    /// Build from a 168-character string of `0`/`1`, hour 0 first.
    pub fn from_bitmap(s: &str) -> Result<Self, ConfigError> {
        if s.len() != Self::HOURS || s.bytes().any(|b| b != b'0' && b != b'1') {
            return Err(ConfigError::BadHourBitmap(s.len()));
        }
        let mut filter = Self::no_hours();
        for (hour, byte) in s.bytes().enumerate() {
            if byte == b'1' {
                filter.set(hour);
            }
        }
        Ok(filter)
    }

    pub fn to_bitmap(&self) -> String {
        (0..Self::HOURS)
            .map(|h| if self.get(h) { '1' } else { '0' })
            .collect()
    }

    fn set(&mut self, hour: usize) {
        self.bits[hour / 64] |= 1u64 << (hour % 64);
    }

    fn get(&self, hour: usize) -> bool {
        self.bits[hour / 64] & (1u64 << (hour % 64)) != 0
    }

    /// True when every hour is accepted.
    pub fn is_default(&self) -> bool {
        *self == Self::all_hours()
    }

    /// Is the hour containing `when` (UTC) accepted?
    pub fn is_included(&self, when: DateTime<Utc>) -> bool {
        let hour = when.weekday().num_days_from_sunday() as usize * 24 + when.hour() as usize;
        self.get(hour)
    }
}

impl Serialize for HourOfWeekFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_bitmap())
    }
}

impl<'de> Deserialize<'de> for HourOfWeekFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HourOfWeekFilter::from_bitmap(&s).map_err(serde::de::Error::custom)
    }
}

/// Typed provider-specific data attached to creatives and agents.
///
/// Connectors register a validator per provider name at startup; unknown
/// providers keep their payload as raw JSON until a connector claims them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderData {
    /// OpenRTB-family exchanges: markup plus the declarations most
    /// exchanges require up front.
    OpenRtb {
        #[serde(default)]
        adm: String,
        #[serde(default)]
        adomain: Vec<String>,
        #[serde(default)]
        mime_types: Vec<String>,
    },
    /// Flat key/value blob for exchanges with bespoke fields.
    KeyValue {
        #[serde(default)]
        values: BTreeMap<String, String>,
    },
    /// Unclaimed payload, preserved verbatim.
    Raw { payload: serde_json::Value },
}

/// An ad unit the agent can serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creative {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub format: Format,
    #[serde(default)]
    pub tags: SegmentList,
    /// Expression over the request's tags; `None` accepts everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligibility_filter: Option<TagFilter>,
    #[serde(default)]
    pub language_filter: IncludeExclude<String>,
    #[serde(default)]
    pub location_filter: PatternIncludeExclude,
    #[serde(default)]
    pub exchange_filter: IncludeExclude<String>,
    #[serde(default)]
    pub provider_data: BTreeMap<String, ProviderData>,
}

impl Creative {
    pub fn new(id: u32, name: &str, format: Format) -> Self {
        Self {
            id,
            name: name.to_string(),
            format,
            tags: SegmentList::default(),
            eligibility_filter: None,
            language_filter: IncludeExclude::default(),
            location_filter: PatternIncludeExclude::default(),
            exchange_filter: IncludeExclude::default(),
            provider_data: BTreeMap::new(),
        }
    }

    /// Standard 300x250 medium rectangle, handy in tests.
    pub fn sample_box(id: u32) -> Self {
        Self::new(id, "box", Format::new(300, 250))
    }

    /// Standard 728x90 leaderboard.
    pub fn sample_leaderboard(id: u32) -> Self {
        Self::new(id, "leaderboard", Format::new(728, 90))
    }

    /// Pure format compatibility with a spot.
    pub fn fits(&self, spot_format: &Format) -> bool {
        self.format.fits(spot_format)
    }

    /// Is this creative allowed on the given exchange?
    pub fn biddable_on(&self, exchange: &str) -> bool {
        self.exchange_filter.is_empty() || self.exchange_filter.accepts(&exchange.to_string())
    }
}

/// What to do about a user (or user+site) after the agent wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistKind {
    #[default]
    Off,
    User,
    UserSite,
}

/// Whose wins feed the blacklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistScope {
    #[default]
    Agent,
    Account,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub kind: BlacklistKind,
    pub scope: BlacklistScope,
    pub duration_secs: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            kind: BlacklistKind::Off,
            scope: BlacklistScope::Agent,
            duration_secs: 0,
        }
    }
}

impl BlacklistConfig {
    pub fn is_enabled(&self) -> bool {
        self.kind != BlacklistKind::Off && self.duration_secs > 0
    }
}

/// Who computes the bid price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BidControl {
    /// The agent computes its own price.
    #[default]
    Relay,
    /// The request is relayed but the router substitutes a fixed price.
    RelayFixed { price_micros: Micros },
    /// The router bids the fixed price without consulting the agent.
    Fixed { price_micros: Micros },
}

impl BidControl {
    /// The substituted CPM, when the router overrides the agent's price.
    pub fn fixed_price(&self) -> Option<Micros> {
        match self {
            BidControl::Relay => None,
            BidControl::RelayFixed { price_micros } | BidControl::Fixed { price_micros } => {
                Some(*price_micros)
            }
        }
    }
}

/// How much detail the agent wants back for a given outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultVerbosity {
    #[default]
    Full,
    Lightweight,
    None,
}

/// A request-enrichment step the agent wants applied before filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub filters: IncludeExclude<String>,
}

impl AugmentationConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: serde_json::Value::Null,
            required: false,
            filters: IncludeExclude::default(),
        }
    }
}

/// Full configuration for one bidding agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Who to bill.
    pub account: AccountKey,

    /// External-system correlation id.
    pub external_id: u64,

    /// Requests matching this config are forwarded to an external agent.
    pub external: bool,

    /// Test agents never place real bids.
    pub test: bool,

    /// Agents in the same group rotate eligibility request-by-request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_robin_group: Option<String>,
    pub round_robin_weight: u32,

    /// Probability in `[0, 1]` of entering a given auction at all.
    pub bid_probability: f64,

    /// Minimum time the agent needs to produce a bid.
    pub min_time_available_ms: u64,

    /// Hard cap on concurrently outstanding solicitations.
    pub max_in_flight: u32,

    /// User-id domains that must be present on the request.
    pub required_ids: Vec<String>,

    pub host_filter: HostIncludeExclude,
    pub url_filter: PatternIncludeExclude,
    pub language_filter: PatternIncludeExclude,
    pub location_filter: PatternIncludeExclude,

    /// Per-taxonomy segment targeting.
    pub segments: BTreeMap<String, SegmentFilter>,

    pub exchange_filter: IncludeExclude<String>,
    pub fold_position_filter: IncludeExclude<FoldPosition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_filter: Option<TagFilter>,

    pub hour_of_week_filter: HourOfWeekFilter,
    pub user_partition: UserPartition,

    pub creatives: Vec<Creative>,

    pub blacklist: BlacklistConfig,
    pub bid_control: BidControl,

    pub augmentations: Vec<AugmentationConfig>,

    pub provider_data: BTreeMap<String, ProviderData>,

    /// Channels for which post-impression visit events are delivered.
    pub visit_channels: SegmentList,

    pub win_format: ResultVerbosity,
    pub loss_format: ResultVerbosity,
    pub error_format: ResultVerbosity,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            account: AccountKey::new(["unassigned"]).expect("static key"),
            external_id: 0,
            external: false,
            test: false,
            round_robin_group: None,
            round_robin_weight: 1,
            bid_probability: 1.0,
            min_time_available_ms: 5,
            max_in_flight: 100,
            required_ids: Vec::new(),
            host_filter: HostIncludeExclude::default(),
            url_filter: PatternIncludeExclude::default(),
            language_filter: PatternIncludeExclude::default(),
            location_filter: PatternIncludeExclude::default(),
            segments: BTreeMap::new(),
            exchange_filter: IncludeExclude::default(),
            fold_position_filter: IncludeExclude::default(),
            tag_filter: None,
            hour_of_week_filter: HourOfWeekFilter::default(),
            user_partition: UserPartition::default(),
            creatives: Vec::new(),
            blacklist: BlacklistConfig::default(),
            bid_control: BidControl::Relay,
            augmentations: Vec::new(),
            provider_data: BTreeMap::new(),
            visit_channels: SegmentList::default(),
            win_format: ResultVerbosity::Full,
            loss_format: ResultVerbosity::Full,
            error_format: ResultVerbosity::Full,
        }
    }
}

impl AgentConfig {
    /// Validate the record before it may be published.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.creatives.is_empty() {
            return Err(ConfigError::NoCreatives);
        }
        let mut seen = Vec::with_capacity(self.creatives.len());
        for creative in &self.creatives {
            if creative.format.is_zero_area() {
                return Err(ConfigError::ZeroAreaCreative(creative.id));
            }
            if seen.contains(&creative.id) {
                return Err(ConfigError::DuplicateCreativeId(creative.id));
            }
            seen.push(creative.id);
        }
        if !(0.0..=1.0).contains(&self.bid_probability) {
            return Err(ConfigError::BadBidProbability(self.bid_probability));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::ZeroMaxInFlight);
        }
        self.user_partition.validate()?;
        if matches!(
            self.bid_control,
            BidControl::Fixed {
                price_micros: Micros(p)
            } | BidControl::RelayFixed {
                price_micros: Micros(p)
            } if p <= 0
        ) {
            return Err(ConfigError::MissingFixedPrice);
        }
        if self.blacklist.kind != BlacklistKind::Off && self.blacklist.duration_secs == 0 {
            return Err(ConfigError::BadBlacklistDuration);
        }
        let mut names: Vec<&str> = self.augmentations.iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        for pair in names.windows(2) {
            if pair[0] == pair[1] {
                return Err(ConfigError::DuplicateAugmentation(pair[0].to_string()));
            }
        }
        Ok(())
    }

    /// Look up a creative by its agent-scoped id.
    pub fn creative(&self, id: u32) -> Option<&Creative> {
        self.creatives.iter().find(|c| c.id == id)
    }
}

impl fmt::Display for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "account={} creatives={} p={}",
            self.account,
            self.creatives.len(),
            self.bid_probability
        )
    }
}
