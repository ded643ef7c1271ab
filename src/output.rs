//! 出力CSVの書き込み
//!
//! ダウンロードしたレポートを1回だけ読み、OutputSpecごとのライターへ流す。

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::Result;
use crate::mapping::{DestinationRow, FieldMapper, InjectedFields, OutputSpec, SourceRow};

/// 既存ファイルの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// 実行ごとに作り直す
    #[default]
    Overwrite,
    /// 既存ファイルの末尾に追記する (ヘッダは新規・空ファイルの時のみ)
    Append,
}

/// 出力結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSummary {
    pub destination: String,
    pub path: PathBuf,
    pub rows: usize,
}

/// OutputSpec 1つ分のCSVライター
///
/// 書き込みは出力先と同じディレクトリの一時ファイルに行い、`finish()` で
/// 出力先へリネームする。途中で失敗した場合は一時ファイルが破棄され、
/// 前回の出力はそのまま残る。
pub struct DestinationWriter<'a> {
    destination: &'a str,
    path: PathBuf,
    mapper: FieldMapper<'a>,
    header: Vec<&'a str>,
    writer: csv::Writer<NamedTempFile>,
    rows: usize,
}

impl<'a> DestinationWriter<'a> {
    pub fn create(out_dir: &Path, spec: &'a OutputSpec, injected: &InjectedFields) -> Result<Self> {
        let path = out_dir.join(&spec.destination);
        let mapper = FieldMapper::new(&spec.columns, injected);
        let header = mapper.header();

        let mut staging = NamedTempFile::new_in(out_dir)?;
        let write_header = match spec.mode {
            OutputMode::Overwrite => true,
            // 既存の内容を一時ファイルへ写してから追記する
            OutputMode::Append => match File::open(&path) {
                Ok(mut existing) => io::copy(&mut existing, &mut staging)? == 0,
                Err(e) if e.kind() == io::ErrorKind::NotFound => true,
                Err(e) => return Err(e.into()),
            },
        };
        if let Ok(metadata) = std::fs::metadata(&path) {
            staging.as_file().set_permissions(metadata.permissions())?;
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(staging);
        if write_header {
            writer.write_record(&header)?;
        }

        info!(
            destination = %spec.destination,
            mode = ?spec.mode,
            columns = spec.columns.len(),
            "Processing file"
        );

        Ok(Self {
            destination: &spec.destination,
            path,
            mapper,
            header,
            writer,
            rows: 0,
        })
    }

    pub fn write_source_row(&mut self, row: &SourceRow) -> Result<()> {
        let mapped = self.mapper.map(row);
        self.write_row(&mapped)
    }

    /// 行に無い列は空セルとして出力する (列そのものは残す)
    pub fn write_row(&mut self, row: &DestinationRow) -> Result<()> {
        let record = self
            .header
            .iter()
            .map(|column| row.get(*column).map(String::as_str).unwrap_or(""));
        self.writer.write_record(record)?;
        self.rows += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<OutputSummary> {
        let staging = self.writer.into_inner().map_err(|e| e.into_error())?;
        staging.persist(&self.path).map_err(|e| e.error)?;
        info!(
            destination = %self.destination,
            rows = self.rows,
            path = ?self.path,
            "File written"
        );
        Ok(OutputSummary {
            destination: self.destination.to_string(),
            path: self.path,
            rows: self.rows,
        })
    }
}

/// レポートファイルを全出力先へ変換する
pub fn normalize(
    source: &Path,
    specs: &[OutputSpec],
    injected: &InjectedFields,
    out_dir: &Path,
) -> Result<Vec<OutputSummary>> {
    info!(source = ?source, outputs = specs.len(), "Writing csvs");
    let file = File::open(source)?;
    normalize_reader(file, specs, injected, out_dir)
}

/// ソースは1回だけ読む。行はまとめて保持しない。
pub fn normalize_reader<R: Read>(
    source: R,
    specs: &[OutputSpec],
    injected: &InjectedFields,
    out_dir: &Path,
) -> Result<Vec<OutputSummary>> {
    std::fs::create_dir_all(out_dir)?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b',')
        .flexible(true)
        .from_reader(source);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            if i == 0 {
                h.trim_start_matches('\u{feff}').to_string()
            } else {
                h.to_string()
            }
        })
        .collect();

    let mut writers = specs
        .iter()
        .map(|spec| DestinationWriter::create(out_dir, spec, injected))
        .collect::<Result<Vec<_>>>()?;

    for record in reader.records() {
        let record = record?;
        // 短い行は存在する列だけを持つ
        let row: SourceRow = headers
            .iter()
            .zip(record.iter())
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();

        for writer in writers.iter_mut() {
            writer.write_source_row(&row)?;
        }
    }

    writers.into_iter().map(DestinationWriter::finish).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::mapping::ColumnMapping;
    use chrono::NaiveDate;

    const SOURCE: &str = "\
a,b,c
1,Shoes,x
2,Shirts,y
3,Hats,z
";

    fn injected() -> InjectedFields {
        InjectedFields::new(
            "CZ",
            "web",
            "heureka",
            NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
        )
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_two_specs_from_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![
            OutputSpec::new(
                "materials.csv",
                ColumnMapping::new([("a", "Material"), ("timestamp", "Date")]).unwrap(),
            ),
            OutputSpec::new(
                "categories.csv",
                ColumnMapping::new([("b", "Category"), ("country", "Country"), ("timestamp", "Date")])
                    .unwrap(),
            ),
        ];

        let summaries =
            normalize_reader(SOURCE.as_bytes(), &specs, &injected(), dir.path()).unwrap();

        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| s.rows == 3));
        assert_eq!(
            read(&dir.path().join("materials.csv")),
            "Material,Date\n1,20240517\n2,20240517\n3,20240517\n"
        );
        assert_eq!(
            read(&dir.path().join("categories.csv")),
            "Category,Country,Date\nShoes,CZ,20240517\nShirts,CZ,20240517\nHats,CZ,20240517\n"
        );
    }

    #[test]
    fn test_header_follows_mapping_order() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![OutputSpec::new(
            "out.csv",
            ColumnMapping::new([("c", "Third"), ("a", "First")]).unwrap(),
        )];

        normalize_reader(SOURCE.as_bytes(), &specs, &injected(), dir.path()).unwrap();

        let content = read(&dir.path().join("out.csv"));
        assert!(content.starts_with("Third,First\nx,1\n"));
    }

    #[test]
    fn test_missing_column_keeps_empty_cell() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![OutputSpec::new(
            "out.csv",
            ColumnMapping::new([("a", "Material"), ("missing", "Gone"), ("b", "Category")])
                .unwrap(),
        )];

        normalize_reader("a,b\n1,Shoes\n".as_bytes(), &specs, &injected(), dir.path()).unwrap();

        assert_eq!(
            read(&dir.path().join("out.csv")),
            "Material,Gone,Category\n1,,Shoes\n"
        );
    }

    #[test]
    fn test_short_row_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![OutputSpec::new(
            "out.csv",
            ColumnMapping::new([("a", "A"), ("c", "C")]).unwrap(),
        )];

        normalize_reader("a,b,c\n1,2\n".as_bytes(), &specs, &injected(), dir.path()).unwrap();

        assert_eq!(read(&dir.path().join("out.csv")), "A,C\n1,\n");
    }

    #[test]
    fn test_bom_is_stripped_from_first_header() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![OutputSpec::new(
            "out.csv",
            ColumnMapping::new([("a", "A")]).unwrap(),
        )];

        normalize_reader("\u{feff}a,b\n1,2\n".as_bytes(), &specs, &injected(), dir.path())
            .unwrap();

        assert_eq!(read(&dir.path().join("out.csv")), "A\n1\n");
    }

    #[test]
    fn test_overwrite_replaces_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![OutputSpec::new(
            "out.csv",
            ColumnMapping::new([("a", "A")]).unwrap(),
        )];

        normalize_reader("a\n1\n".as_bytes(), &specs, &injected(), dir.path()).unwrap();
        normalize_reader("a\n2\n".as_bytes(), &specs, &injected(), dir.path()).unwrap();

        assert_eq!(read(&dir.path().join("out.csv")), "A\n2\n");
    }

    #[test]
    fn test_append_keeps_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![OutputSpec::new(
            "out.csv",
            ColumnMapping::new([("a", "A")]).unwrap(),
        )
        .with_mode(OutputMode::Append)];

        normalize_reader("a\n1\n".as_bytes(), &specs, &injected(), dir.path()).unwrap();
        let summaries =
            normalize_reader("a\n2\n".as_bytes(), &specs, &injected(), dir.path()).unwrap();

        assert_eq!(summaries[0].rows, 1);
        assert_eq!(read(&dir.path().join("out.csv")), "A\n1\n2\n");
    }

    #[test]
    fn test_failed_run_keeps_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![
            OutputSpec::new("out.csv", ColumnMapping::new([("a", "A")]).unwrap()),
            OutputSpec::new("log.csv", ColumnMapping::new([("a", "A")]).unwrap())
                .with_mode(OutputMode::Append),
        ];
        normalize_reader("a\n1\n2\n3\n".as_bytes(), &specs, &injected(), dir.path()).unwrap();

        // 2行目が不正なUTF-8
        let broken: &[u8] = b"a\n9\n\xff\xfe\n";
        let result = normalize_reader(broken, &specs, &injected(), dir.path());

        assert!(matches!(result, Err(SyncError::Csv(_))));
        assert_eq!(read(&dir.path().join("out.csv")), "A\n1\n2\n3\n");
        assert_eq!(read(&dir.path().join("log.csv")), "A\n1\n2\n3\n");
        // 一時ファイルは残らない
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_normalize_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("report.csv");
        std::fs::write(&source, SOURCE).unwrap();
        let out_dir = dir.path().join("out");
        let specs = vec![OutputSpec::new(
            "out.csv",
            ColumnMapping::new([("b", "Category")]).unwrap(),
        )];

        let summaries = normalize(&source, &specs, &injected(), &out_dir).unwrap();

        assert_eq!(summaries[0].path, out_dir.join("out.csv"));
        assert_eq!(summaries[0].rows, 3);
    }
}
