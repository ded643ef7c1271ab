use std::collections::BTreeMap;
use std::sync::LazyLock;

use reqwest::Url;
use scraper::{Html, Selector};

use crate::error::{Result, SyncError};

static NAMED_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("input[name]").expect("valid selector"));

/// ステータス欄に埋め込まれた生成リクエスト用パラメータ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportParams {
    values: BTreeMap<String, String>,
}

impl ReportParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// `keys` の順にクエリへ追加した生成リクエストURL
    pub fn trigger_url(&self, base: &str, keys: &[String]) -> Result<String> {
        let mut url = Url::parse(base)
            .map_err(|e| SyncError::Config(format!("invalid report url {}: {}", base, e)))?;
        {
            let mut query = url.query_pairs_mut();
            for key in keys {
                let value = self
                    .get(key)
                    .ok_or_else(|| SyncError::MissingParameter(key.clone()))?;
                query.append_pair(key, value);
            }
        }
        Ok(url.into())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ReportParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn is_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_lowercase())
}

/// 1文字の name を持つ `<input>` の name/value を集める。見つからなければ空
pub fn extract_params(markup: &str) -> ReportParams {
    let fragment = Html::parse_fragment(markup);
    fragment
        .select(&NAMED_INPUT)
        .filter_map(|input| {
            let element = input.value();
            let name = element.attr("name")?;
            if !is_param_name(name) {
                return None;
            }
            element.attr("value").map(|value| (name, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_single_letter_inputs() {
        let markup = r#"<td>
            <input name="s" value="a1b2" type="hidden">
            <input type="hidden" value="20240517" name="d">
            <input name="l" value="cs">
            <input name="token" value="ignored">
        </td>"#;

        let params = extract_params(markup);

        assert_eq!(params.len(), 3);
        assert_eq!(params.get("s"), Some("a1b2"));
        assert_eq!(params.get("d"), Some("20240517"));
        assert_eq!(params.get("l"), Some("cs"));
        assert_eq!(params.get("token"), None);
    }

    #[test]
    fn test_entities_are_decoded() {
        let params = extract_params(r#"<input name="s" value="a&amp;b&#x3D;c">"#);
        assert_eq!(params.get("s"), Some("a&b=c"));
    }

    #[test]
    fn test_no_inputs_gives_empty_params() {
        assert!(extract_params("").is_empty());
        assert!(extract_params("<td>17.05.2024 13:45:10</td>").is_empty());
        assert!(extract_params("<div><input type=\"submit\"></div>").is_empty());
    }

    #[test]
    fn test_input_without_value_is_skipped() {
        assert!(extract_params(r#"<input name="s">"#).is_empty());
    }

    #[test]
    fn test_trigger_url_in_key_order() {
        let params: ReportParams = [("d", "2"), ("s", "1"), ("l", "3")].into_iter().collect();
        let keys = vec!["s".to_string(), "d".to_string(), "l".to_string()];

        let url = params
            .trigger_url("https://portal.example/obchody/sortiment-report/", &keys)
            .unwrap();

        assert_eq!(url, "https://portal.example/obchody/sortiment-report/?s=1&d=2&l=3");
    }

    #[test]
    fn test_trigger_url_missing_key() {
        let params: ReportParams = [("s", "1")].into_iter().collect();
        let keys = vec!["s".to_string(), "d".to_string()];

        let result = params.trigger_url("https://portal.example/", &keys);

        assert!(matches!(result, Err(SyncError::MissingParameter(k)) if k == "d"));
    }
}
