//! Core domain model for the LVR open-data feed: ROC calendar dates, notice
//! date ranges, region codes and the normalized transaction record.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const CRATE_NAME: &str = "lvr-core";

/// One ping in square meters.
pub const SQM_PER_PING: f64 = 3.305785;

/// A Minguo (ROC) calendar date as published by the feed. Gregorian year is
/// `year + 1911`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RocDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl RocDate {
    pub fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    pub fn to_gregorian(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(i32::from(self.year) + 1911, u32::from(self.month), u32::from(self.day))
    }
}

impl fmt::Display for RocDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.year, self.month, self.day)
    }
}

impl Serialize for RocDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RocDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let mut parts = raw.split('-');
        let year = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| D::Error::custom(format!("bad ROC date: {raw}")))?;
        let month = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| D::Error::custom(format!("bad ROC date: {raw}")))?;
        let day = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| D::Error::custom(format!("bad ROC date: {raw}")))?;
        Ok(Self { year, month, day })
    }
}

/// Which date the notice range refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeDateLabel {
    RegistrationDate,
    ContractDate,
    TransactionDate,
}

impl NoticeDateLabel {
    /// The label exactly as it appears in the published notice.
    pub fn as_feed_label(self) -> &'static str {
        match self {
            Self::RegistrationDate => "登記日期",
            Self::ContractDate => "訂約日期",
            Self::TransactionDate => "交易日期",
        }
    }

    pub fn from_feed_label(label: &str) -> Option<Self> {
        match label {
            "登記日期" => Some(Self::RegistrationDate),
            "訂約日期" => Some(Self::ContractDate),
            "交易日期" => Some(Self::TransactionDate),
            _ => None,
        }
    }
}

/// One date range extracted from the notice text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoticeDateRange {
    pub label: NoticeDateLabel,
    pub start: RocDate,
    pub end: RocDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRangeBounds {
    pub start: RocDate,
    pub end: RocDate,
}

/// Canonical, order-independent form of the notice content. BTreeMap keys
/// serialize in a stable order, so the fingerprint hash of this value never
/// depends on the order the ranges were matched in.
pub fn canonical_content(ranges: &[NoticeDateRange]) -> BTreeMap<String, DateRangeBounds> {
    ranges
        .iter()
        .map(|r| {
            (
                r.label.as_feed_label().to_string(),
                DateRangeBounds {
                    start: r.start,
                    end: r.end,
                },
            )
        })
        .collect()
}

/// Region name for a single-letter feed region code.
pub fn region_for_code(code: char) -> Option<&'static str> {
    match code {
        'c' => Some("基隆"),
        'a' => Some("臺北"),
        'f' => Some("新北"),
        'h' => Some("桃園"),
        'o' | 'j' => Some("新竹"),
        'k' => Some("苗栗"),
        'b' => Some("臺中"),
        'm' => Some("南投"),
        'n' => Some("彰化"),
        'p' => Some("雲林"),
        'i' | 'q' => Some("嘉義"),
        'd' => Some("臺南"),
        'e' => Some("高雄"),
        't' => Some("屏東"),
        'g' => Some("宜蘭"),
        'u' => Some("花蓮"),
        'v' => Some("臺東"),
        'x' => Some("澎湖"),
        'w' => Some("金門"),
        'z' => Some("連江"),
        _ => None,
    }
}

/// Region name for a record file named `{code}_lvr_land_{a|b}.csv`. Files
/// that do not follow the convention (or carry an unknown region code) get
/// `None` and are skipped by the import stage.
pub fn region_for_filename(filename: &str) -> Option<&'static str> {
    let lower = filename.to_ascii_lowercase();
    let stem = lower.strip_suffix(".csv")?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() != 4 || parts[1] != "lvr" || parts[2] != "land" {
        return None;
    }
    if !matches!(parts[3], "a" | "b") {
        return None;
    }
    let mut chars = parts[0].chars();
    let code = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    region_for_code(code)
}

/// Whether a record file holds pre-sale transactions (`*_b.csv`).
pub fn is_presale_filename(filename: &str) -> bool {
    filename.to_ascii_lowercase().ends_with("b.csv")
}

/// A Gregorian date converted from a compact ROC date string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GregorianDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl GregorianDate {
    /// `YYYYMMDD` form used in region table columns.
    pub fn compact(self) -> String {
        format!("{:04}{:02}{:02}", self.year, self.month, self.day)
    }

    pub fn to_naive(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

/// Convert a compact ROC date (`"1140611"`) to Gregorian. The leading digit
/// run is split as: last two digits day, previous two month, remainder plus
/// 1911 the year. Needs at least six digits; anything malformed yields `None`
/// rather than an error, matching the feed's loose formatting.
pub fn roc_compact_to_gregorian(input: &str) -> Option<GregorianDate> {
    let trimmed = input.trim();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() < 6 {
        return None;
    }
    let (rest, day) = digits.split_at(digits.len() - 2);
    let (year_part, month) = rest.split_at(rest.len() - 2);
    let year = year_part.parse::<i32>().ok()? + 1911;
    let month = month.parse::<u32>().ok()?;
    let day = day.parse::<u32>().ok()?;
    Some(GregorianDate { year, month, day })
}

/// Coarse transaction category. Substring-based on the raw trade-object
/// text; an open heuristic with an explicit fallback, not a closed taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeCategory {
    Housing,
    Land,
    Parking,
    Other,
}

impl TradeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Housing => "房地",
            Self::Land => "土地",
            Self::Parking => "車位",
            Self::Other => "其他",
        }
    }
}

impl Serialize for TradeCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

pub fn classify_trade_object(trade_object: &str) -> TradeCategory {
    if trade_object.contains('房') {
        TradeCategory::Housing
    } else if trade_object.contains('土') {
        TradeCategory::Land
    } else if trade_object.contains('車') {
        TradeCategory::Parking
    } else {
        TradeCategory::Other
    }
}

pub fn has_parking(trade_object: &str) -> bool {
    trade_object.contains('車')
}

pub fn has_elevator(building_type: &str) -> bool {
    building_type.contains("有電梯")
}

/// House-condition bucket derived from house age; presale records have no
/// age and form their own bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HouseCondition {
    New,
    Recent,
    Used,
    Old,
    Presale,
}

impl HouseCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "新屋",
            Self::Recent => "新古屋",
            Self::Used => "中古屋",
            Self::Old => "老屋",
            Self::Presale => "預售屋",
        }
    }
}

impl Serialize for HouseCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

pub fn condition_for_age(age_years: f64) -> HouseCondition {
    if age_years <= 3.0 {
        HouseCondition::New
    } else if age_years <= 10.0 {
        HouseCondition::Recent
    } else if age_years <= 20.0 {
        HouseCondition::Used
    } else {
        HouseCondition::Old
    }
}

/// Prefix before the first parenthetical suffix, e.g.
/// `房地(土地+建物)` -> `房地`.
pub fn strip_parenthetical(text: &str) -> &str {
    match text.find('(') {
        Some(idx) => &text[..idx],
        None => text,
    }
}

/// One normalized row of a region table. Owned by the region table once
/// loaded; corrections require a new import cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformedRecord {
    pub region: String,
    pub district: String,
    pub trade_object: String,
    pub building_type: String,
    pub main_use: String,
    pub area_sqm: Option<f64>,
    pub total_price: Option<i64>,
    pub parking_area_sqm: Option<f64>,
    pub parking_price: Option<i64>,
    pub area_ping: f64,
    pub total_price_wan: f64,
    pub unit_price_wan: f64,
    pub parking_ping: f64,
    pub parking_price_wan: f64,
    pub category: TradeCategory,
    pub has_parking: bool,
    pub has_elevator: bool,
    pub trade_date: String,
    pub trade_year: String,
    pub trade_month: String,
    pub trade_day: String,
    pub completion_date: String,
    pub house_age: Option<f64>,
    pub house_condition: Option<HouseCondition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roc_compact_converts_to_gregorian() {
        let date = roc_compact_to_gregorian("1140611").expect("valid date");
        assert_eq!(date.year, 2025);
        assert_eq!(date.month, 6);
        assert_eq!(date.day, 11);
        assert_eq!(date.compact(), "20250611");
    }

    #[test]
    fn roc_compact_handles_six_digit_input() {
        let date = roc_compact_to_gregorian("990611").expect("valid date");
        assert_eq!(date.year, 2010);
        assert_eq!(date.compact(), "20100611");
    }

    #[test]
    fn roc_compact_rejects_malformed_input() {
        assert_eq!(roc_compact_to_gregorian(""), None);
        assert_eq!(roc_compact_to_gregorian("abc"), None);
        assert_eq!(roc_compact_to_gregorian("12345"), None);
    }

    #[test]
    fn roc_compact_ignores_trailing_garbage() {
        let date = roc_compact_to_gregorian("1130515 付款").expect("valid date");
        assert_eq!(date.compact(), "20240515");
    }

    #[test]
    fn canonical_content_is_order_independent() {
        let a = NoticeDateRange {
            label: NoticeDateLabel::RegistrationDate,
            start: RocDate::new(114, 6, 11),
            end: RocDate::new(114, 6, 20),
        };
        let b = NoticeDateRange {
            label: NoticeDateLabel::TransactionDate,
            start: RocDate::new(114, 5, 11),
            end: RocDate::new(114, 5, 20),
        };
        assert_eq!(canonical_content(&[a, b]), canonical_content(&[b, a]));
    }

    #[test]
    fn roc_date_serializes_like_the_feed() {
        let date = RocDate::new(114, 6, 11);
        assert_eq!(serde_json::to_string(&date).unwrap(), "\"114-6-11\"");
    }

    #[test]
    fn region_map_covers_known_codes_only() {
        assert_eq!(region_for_filename("a_lvr_land_a.csv"), Some("臺北"));
        assert_eq!(region_for_filename("E_LVR_LAND_B.CSV"), Some("高雄"));
        assert_eq!(region_for_filename("y_lvr_land_a.csv"), None);
        assert_eq!(region_for_filename("manifest.csv"), None);
        assert_eq!(region_for_filename("a_lvr_land_c.csv"), None);
    }

    #[test]
    fn every_known_code_resolves_from_a_filename() {
        for code in "abcdefghijkmnopqtuvwxz".chars() {
            let filename = format!("{code}_lvr_land_a.csv");
            assert!(
                region_for_filename(&filename).is_some(),
                "code {code} should map to a region"
            );
        }
    }

    #[test]
    fn classification_falls_back_to_other() {
        assert_eq!(classify_trade_object("房地(土地+建物)"), TradeCategory::Housing);
        assert_eq!(classify_trade_object("土地"), TradeCategory::Land);
        assert_eq!(classify_trade_object("車位"), TradeCategory::Parking);
        assert_eq!(classify_trade_object("建物"), TradeCategory::Other);
    }

    #[test]
    fn condition_buckets_by_age() {
        assert_eq!(condition_for_age(2.9), HouseCondition::New);
        assert_eq!(condition_for_age(3.0), HouseCondition::New);
        assert_eq!(condition_for_age(9.5), HouseCondition::Recent);
        assert_eq!(condition_for_age(15.0), HouseCondition::Used);
        assert_eq!(condition_for_age(20.1), HouseCondition::Old);
    }

    #[test]
    fn parenthetical_suffix_is_stripped() {
        assert_eq!(strip_parenthetical("房地(土地+建物)"), "房地");
        assert_eq!(strip_parenthetical("住宅大樓(11層含以上有電梯)"), "住宅大樓");
        assert_eq!(strip_parenthetical("土地"), "土地");
    }
}
