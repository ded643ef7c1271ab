use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use scraper::{Html, Selector};

/// ポータルが生成開始時刻を表示する書式
pub const STATUS_TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

static TD_WRAPPER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?td[^>]*>").expect("valid regex"));

static TD: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("valid selector"));

/// レポートの生成状態 (毎回ステータス欄から再計算する)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    /// ステータス欄が見つからない
    Unknown,
    /// 生成中。新しい生成は要求しない
    InProgress { started_at: NaiveDateTime },
    /// 生成中のものは無い
    Ready,
}

/// ステータス欄が時刻として読めれば生成中、それ以外 (空・不正な文字列) はすべて Ready
pub fn detect_state(fragment: &str) -> ReportState {
    let text = TD_WRAPPER.replace_all(fragment, "");
    match NaiveDateTime::parse_from_str(text.trim(), STATUS_TIMESTAMP_FORMAT) {
        Ok(started_at) => ReportState::InProgress { started_at },
        Err(_) => ReportState::Ready,
    }
}

/// ページ中 `index` 番目の `<td>` (0始まり) を外側のHTMLごと返す
pub fn find_status_fragment(page: &str, index: usize) -> Option<String> {
    let document = Html::parse_document(page);
    document.select(&TD).nth(index).map(|td| td.html())
}
