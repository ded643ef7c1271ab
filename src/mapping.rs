//! 列マッピング
//!
//! レポートの1行 (SourceRow) を出力先ごとの列構成 (DestinationRow) に変換する。
//! I/Oは行わない。

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::NaiveDate;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::output::OutputMode;

/// 予約済みの仮想ソース列
pub const COUNTRY: &str = "country";
pub const DISTRCHAN: &str = "distrchan";
pub const SOURCE: &str = "source";
pub const TIMESTAMP: &str = "timestamp";

/// 取込日付の書式
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d";

pub type SourceRow = HashMap<String, String>;
pub type DestinationRow = HashMap<String, String>;

/// ソース列名 → 出力列名 (宣言順を保持)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnMapping {
    pairs: Vec<(String, String)>,
}

impl ColumnMapping {
    /// ソース列・出力列のどちらかが重複していればエラー
    pub fn new<I, S, D>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<String>,
        D: Into<String>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(s, d)| (s.into(), d.into()))
            .collect();

        let mut sources = HashSet::new();
        let mut destinations = HashSet::new();
        for (source, destination) in &pairs {
            if !sources.insert(source.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate source column in mapping: {}",
                    source
                )));
            }
            if !destinations.insert(destination.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate destination column in mapping: {}",
                    destination
                )));
            }
        }

        Ok(Self { pairs })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(s, d)| (s.as_str(), d.as_str()))
    }

    /// 出力ファイルのヘッダ順
    pub fn destinations(&self) -> Vec<&str> {
        self.pairs.iter().map(|(_, d)| d.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

// JSONオブジェクトのキー順をそのまま列順として使う
impl<'de> Deserialize<'de> for ColumnMapping {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MappingVisitor;

        impl<'de> Visitor<'de> for MappingVisitor {
            type Value = ColumnMapping;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of source column -> destination column")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((source, destination)) = map.next_entry::<String, String>()? {
                    pairs.push((source, destination));
                }
                ColumnMapping::new(pairs).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_map(MappingVisitor)
    }
}

/// 出力ファイル1つ分の定義
#[derive(Debug, Clone, Deserialize)]
pub struct OutputSpec {
    /// 出力ファイル名
    pub destination: String,
    pub columns: ColumnMapping,
    #[serde(default)]
    pub mode: OutputMode,
}

impl OutputSpec {
    pub fn new(destination: impl Into<String>, columns: ColumnMapping) -> Self {
        Self {
            destination: destination.into(),
            columns,
            mode: OutputMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }
}

/// 実行時に計算される定数列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFields {
    country: String,
    distrchan: String,
    source: String,
    timestamp: String,
}

impl InjectedFields {
    /// `ingested_on` は実行ごとに1回だけ計算して全行・全出力で共有する
    pub fn new(
        country: impl Into<String>,
        distrchan: impl Into<String>,
        source: impl Into<String>,
        ingested_on: NaiveDate,
    ) -> Self {
        Self {
            country: country.into(),
            distrchan: distrchan.into(),
            source: source.into(),
            timestamp: ingested_on.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            COUNTRY => Some(&self.country),
            DISTRCHAN => Some(&self.distrchan),
            SOURCE => Some(&self.source),
            TIMESTAMP => Some(&self.timestamp),
            _ => None,
        }
    }
}

/// 出力仕様1つに対する行変換
#[derive(Debug, Clone)]
pub struct FieldMapper<'a> {
    mapping: &'a ColumnMapping,
    /// (出力列, 値)。マッピングが参照する予約キーのみ
    injected: Vec<(&'a str, String)>,
}

impl<'a> FieldMapper<'a> {
    pub fn new(mapping: &'a ColumnMapping, fields: &InjectedFields) -> Self {
        let injected = mapping
            .iter()
            .filter_map(|(source, destination)| {
                fields
                    .get(source)
                    .map(|value| (destination, value.to_string()))
            })
            .collect();

        Self { mapping, injected }
    }

    /// 存在しない列は単に出力されない。予約キーはソース列より優先される。
    pub fn map(&self, row: &SourceRow) -> DestinationRow {
        let mut out: DestinationRow = self
            .mapping
            .iter()
            .filter_map(|(source, destination)| {
                row.get(source)
                    .map(|value| (destination.to_string(), value.clone()))
            })
            .collect();

        for (destination, value) in &self.injected {
            out.insert(destination.to_string(), value.clone());
        }

        out
    }

    pub fn header(&self) -> Vec<&'a str> {
        self.mapping.destinations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> SourceRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn fields() -> InjectedFields {
        InjectedFields::new(
            "CZ",
            "web",
            "heureka",
            NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
        )
    }

    #[test]
    fn test_map_selects_and_renames() {
        let mapping = ColumnMapping::new([("a", "Material"), ("b", "Category")]).unwrap();
        let mapper = FieldMapper::new(&mapping, &fields());

        let out = mapper.map(&row(&[("a", "123"), ("b", "Shoes"), ("c", "ignored")]));

        assert_eq!(out, row(&[("Material", "123"), ("Category", "Shoes")]));
    }

    #[test]
    fn test_missing_source_column_is_skipped() {
        let mapping = ColumnMapping::new([("a", "Material"), ("zzz", "Missing")]).unwrap();
        let mapper = FieldMapper::new(&mapping, &fields());

        let out = mapper.map(&row(&[("a", "1")]));

        assert_eq!(out.len(), 1);
        assert!(!out.contains_key("Missing"));
    }

    #[test]
    fn test_injected_field_wins_over_source_column() {
        let mapping = ColumnMapping::new([("country", "Country"), ("a", "Material")]).unwrap();
        let mapper = FieldMapper::new(&mapping, &fields());

        let out = mapper.map(&row(&[("country", "SK"), ("a", "1")]));

        assert_eq!(out.get("Country").map(String::as_str), Some("CZ"));
    }

    #[test]
    fn test_unreferenced_reserved_keys_are_not_materialized() {
        let mapping = ColumnMapping::new([("a", "Material")]).unwrap();
        let mapper = FieldMapper::new(&mapping, &fields());

        let out = mapper.map(&row(&[("a", "1")]));

        assert_eq!(out, row(&[("Material", "1")]));
    }

    #[test]
    fn test_all_reserved_keys() {
        let mapping = ColumnMapping::new([
            ("country", "Country"),
            ("distrchan", "Channel"),
            ("source", "Origin"),
            ("timestamp", "Date"),
        ])
        .unwrap();
        let mapper = FieldMapper::new(&mapping, &fields());

        let out = mapper.map(&SourceRow::new());

        assert_eq!(
            out,
            row(&[
                ("Country", "CZ"),
                ("Channel", "web"),
                ("Origin", "heureka"),
                ("Date", "20240517"),
            ])
        );
    }

    #[test]
    fn test_map_is_idempotent() {
        let mapping = ColumnMapping::new([("a", "Material"), ("country", "Country")]).unwrap();
        let mapper = FieldMapper::new(&mapping, &fields());
        let source = row(&[("a", "123")]);

        assert_eq!(mapper.map(&source), mapper.map(&source));
    }

    #[test]
    fn test_duplicate_destination_is_rejected() {
        let result = ColumnMapping::new([("a", "X"), ("b", "X")]);
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_deserialize_keeps_declaration_order() {
        let mapping: ColumnMapping =
            serde_json::from_str(r#"{"z": "Last", "a": "First", "m": "Middle"}"#).unwrap();

        assert_eq!(mapping.destinations(), vec!["Last", "First", "Middle"]);
    }

    #[test]
    fn test_deserialize_rejects_duplicate_destination() {
        let result: std::result::Result<ColumnMapping, _> =
            serde_json::from_str(r#"{"a": "X", "b": "X"}"#);
        assert!(result.is_err());
    }
}
