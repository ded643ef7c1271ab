use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::{Captures, Regex};
use scraper::{Html, Selector};
use serde::Deserialize;

static LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

// 2024-05-17_13-45-10, 20240517134510, 2024-05-17 など
static LINK_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<y>\d{4})-?(?P<m>\d{2})-?(?P<d>\d{2})(?:[T_ \-]?(?P<hh>\d{2})[:\-]?(?P<mm>\d{2})(?:[:\-]?(?P<ss>\d{2}))?)?",
    )
    .expect("valid regex")
});

/// 複数候補から1つを選ぶ方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSelection {
    /// ページ上の最初の候補 (ポータルは新しい順に並べる)
    #[default]
    DocumentOrder,
    /// リンクから読み取った日時が最も新しい候補。同じならページ上の順
    NewestTimestamp,
}

/// レポートファイルとみなすリンクの条件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactRule {
    /// 拡張子 (ドットなし)
    pub extension: String,
    /// URLに含まれるべき文字列
    pub marker: String,
    pub selection: ArtifactSelection,
}

impl Default for ArtifactRule {
    fn default() -> Self {
        Self {
            extension: "csv".to_string(),
            marker: "sortiment-report".to_string(),
            selection: ArtifactSelection::default(),
        }
    }
}

impl ArtifactRule {
    pub fn matches(&self, href: &str) -> bool {
        href.ends_with(&self.extension) && href.contains(&self.marker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// エンティティ展開済みの href (相対URLのまま)
    pub url: String,
    pub timestamp: Option<NaiveDateTime>,
}

impl Artifact {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let timestamp = infer_timestamp(&url);
        Self { url, timestamp }
    }
}

fn capture_num(caps: &Captures, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

/// ファイル名部分から日時を推定する
fn infer_timestamp(url: &str) -> Option<NaiveDateTime> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file_name = path.rsplit('/').next().unwrap_or(path);

    LINK_TIMESTAMP.captures_iter(file_name).find_map(|caps| {
        let y = caps.name("y")?.as_str().parse().ok()?;
        let date = NaiveDate::from_ymd_opt(y, capture_num(&caps, "m")?, capture_num(&caps, "d")?)?;
        let hh = capture_num(&caps, "hh").unwrap_or(0);
        let mm = capture_num(&caps, "mm").unwrap_or(0);
        let ss = capture_num(&caps, "ss").unwrap_or(0);
        date.and_hms_opt(hh, mm, ss)
    })
}

/// 条件に合う最新のレポートファイルを返す。候補が無ければ None
pub fn locate_artifact(page: &str, rule: &ArtifactRule) -> Option<Artifact> {
    let document = Html::parse_document(page);
    let mut candidates = document
        .select(&LINK)
        .filter_map(|link| link.value().attr("href"))
        .filter(|href| rule.matches(href))
        .map(Artifact::new);

    match rule.selection {
        ArtifactSelection::DocumentOrder => candidates.next(),
        ArtifactSelection::NewestTimestamp => candidates.fold(None, |best, candidate| match best {
            // Option の順序で None < Some になる
            Some(current) if current_is_newer_or_equal(&current, &candidate) => Some(current),
            _ => Some(candidate),
        }),
    }
}

fn current_is_newer_or_equal(current: &Artifact, candidate: &Artifact) -> bool {
    current.timestamp >= candidate.timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(hrefs: &[&str]) -> String {
        let links: String = hrefs
            .iter()
            .map(|href| format!("<tr><td><a href=\"{}\">download</a></td></tr>", href))
            .collect();
        format!("<html><body><table>{}</table></body></html>", links)
    }

    fn rule(selection: ArtifactSelection) -> ArtifactRule {
        ArtifactRule {
            selection,
            ..Default::default()
        }
    }

    #[test]
    fn test_picks_marked_csv_link() {
        let page = listing(&["x.csv", "sortiment-report-2024.csv", "report.txt"]);

        for selection in [ArtifactSelection::DocumentOrder, ArtifactSelection::NewestTimestamp] {
            let artifact = locate_artifact(&page, &rule(selection)).unwrap();
            assert_eq!(artifact.url, "sortiment-report-2024.csv");
        }
    }

    #[test]
    fn test_no_candidate() {
        let page = listing(&["x.csv", "sortiment-report.txt", "/help"]);
        assert_eq!(locate_artifact(&page, &ArtifactRule::default()), None);
        assert_eq!(locate_artifact("", &ArtifactRule::default()), None);
    }

    #[test]
    fn test_document_order_takes_first() {
        let page = listing(&[
            "/files/sortiment-report-2024-05-01.csv",
            "/files/sortiment-report-2024-05-17.csv",
        ]);

        let artifact = locate_artifact(&page, &rule(ArtifactSelection::DocumentOrder)).unwrap();

        assert_eq!(artifact.url, "/files/sortiment-report-2024-05-01.csv");
    }

    #[test]
    fn test_newest_timestamp_survives_unordered_listing() {
        let page = listing(&[
            "/files/sortiment-report-2024-05-01_08-00-00.csv",
            "/files/sortiment-report-2024-05-17_09-30-00.csv",
            "/files/sortiment-report-2024-05-17_07-15-00.csv",
        ]);

        let artifact = locate_artifact(&page, &rule(ArtifactSelection::NewestTimestamp)).unwrap();

        assert_eq!(artifact.url, "/files/sortiment-report-2024-05-17_09-30-00.csv");
    }

    #[test]
    fn test_newest_timestamp_ties_keep_document_order() {
        let page = listing(&[
            "/a/sortiment-report.csv",
            "/b/sortiment-report.csv",
        ]);

        let artifact = locate_artifact(&page, &rule(ArtifactSelection::NewestTimestamp)).unwrap();

        assert_eq!(artifact.url, "/a/sortiment-report.csv");
    }

    #[test]
    fn test_dated_candidate_beats_undated() {
        let page = listing(&[
            "/a/sortiment-report.csv",
            "/b/sortiment-report-20240517.csv",
        ]);

        let artifact = locate_artifact(&page, &rule(ArtifactSelection::NewestTimestamp)).unwrap();

        assert_eq!(artifact.url, "/b/sortiment-report-20240517.csv");
    }

    #[test]
    fn test_default_takes_first_link_of_newest_first_listing() {
        // 最新のリンクだけ日付が無い
        let page = listing(&[
            "/files/sortiment-report.csv",
            "/files/sortiment-report-20240516.csv",
            "/files/sortiment-report-20240515.csv",
        ]);

        let artifact = locate_artifact(&page, &ArtifactRule::default()).unwrap();

        assert_eq!(ArtifactRule::default().selection, ArtifactSelection::DocumentOrder);
        assert_eq!(artifact.url, "/files/sortiment-report.csv");
    }

    #[test]
    fn test_href_entities_are_decoded() {
        let page = r#"<a href="/download?file=sortiment-report&amp;format=csv">x</a>"#;

        let artifact = locate_artifact(page, &ArtifactRule::default()).unwrap();

        assert_eq!(artifact.url, "/download?file=sortiment-report&format=csv");
    }

    #[test]
    fn test_infer_timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(13, 45, 10)
            .unwrap();
        assert_eq!(infer_timestamp("sortiment-report-2024-05-17_13-45-10.csv"), Some(expected));
        assert_eq!(infer_timestamp("/x/sortiment-report-20240517134510.csv"), Some(expected));
        assert_eq!(
            infer_timestamp("sortiment-report-2024-05-17.csv"),
            NaiveDate::from_ymd_opt(2024, 5, 17).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(infer_timestamp("sortiment-report-2024.csv"), None);
        assert_eq!(infer_timestamp("sortiment-report-99999999.csv"), None);
    }
}
