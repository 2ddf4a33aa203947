use anyhow::{Context, Result};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::rows::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    Spreadsheet,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Spreadsheet => "xml",
        }
    }
}

/// Write `rows` to `<dir>/<stem>.<ext>` and return the path.
pub fn export(rows: &[Row], format: ExportFormat, dir: &Path, stem: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating export directory {}", dir.display()))?;
    let path = dir.join(format!("{}.{}", file_stem(stem), format.extension()));

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut out = BufWriter::new(file);

    match format {
        ExportFormat::Json => write_json(rows, &mut out)?,
        ExportFormat::Csv => write_csv(rows, &mut out)?,
        ExportFormat::Spreadsheet => write_spreadsheet(rows, &mut out)?,
    }
    out.flush()
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn file_stem(project: &str) -> String {
    let stem: String = project
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() { "export".to_string() } else { stem }
}

/// Column order comes from the first row.
fn header(rows: &[Row]) -> Vec<&str> {
    rows.first().map(|r| r.columns().collect()).unwrap_or_default()
}

pub fn write_json<W: Write>(rows: &[Row], out: &mut W) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, rows)?;
    out.write_all(b"\n")?;
    Ok(())
}

pub fn write_csv<W: Write>(rows: &[Row], out: &mut W) -> Result<()> {
    let columns = header(rows);
    if columns.is_empty() {
        return Ok(());
    }
    write_record(out, columns.iter().copied())?;
    for row in rows {
        write_record(out, columns.iter().map(|c| row.get(c).unwrap_or("")))?;
    }
    Ok(())
}

fn write_record<'a, W: Write>(out: &mut W, fields: impl Iterator<Item = &'a str>) -> Result<()> {
    let line: Vec<String> = fields.map(csv_field).collect();
    out.write_all(line.join(",").as_bytes())?;
    out.write_all(b"\r\n")?;
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// SpreadsheetML 2003 workbook with one worksheet.
pub fn write_spreadsheet<W: Write>(rows: &[Row], out: &mut W) -> Result<()> {
    let mut xml = Writer::new_with_indent(out, b' ', 1);
    xml.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut workbook = BytesStart::new("Workbook");
    workbook.push_attribute(("xmlns", "urn:schemas-microsoft-com:office:spreadsheet"));
    workbook.push_attribute(("xmlns:ss", "urn:schemas-microsoft-com:office:spreadsheet"));
    xml.write_event(Event::Start(workbook))?;

    let mut sheet = BytesStart::new("Worksheet");
    sheet.push_attribute(("ss:Name", "Rows"));
    xml.write_event(Event::Start(sheet))?;
    xml.write_event(Event::Start(BytesStart::new("Table")))?;

    let columns = header(rows);
    if !columns.is_empty() {
        write_sheet_row(&mut xml, columns.iter().copied())?;
        for row in rows {
            write_sheet_row(&mut xml, columns.iter().map(|c| row.get(c).unwrap_or("")))?;
        }
    }

    xml.write_event(Event::End(BytesEnd::new("Table")))?;
    xml.write_event(Event::End(BytesEnd::new("Worksheet")))?;
    xml.write_event(Event::End(BytesEnd::new("Workbook")))?;
    Ok(())
}

fn write_sheet_row<'a, W: Write>(
    xml: &mut Writer<W>,
    cells: impl Iterator<Item = &'a str>,
) -> Result<()> {
    xml.write_event(Event::Start(BytesStart::new("Row")))?;
    for value in cells {
        xml.write_event(Event::Start(BytesStart::new("Cell")))?;
        let mut data = BytesStart::new("Data");
        data.push_attribute(("ss:Type", "String"));
        xml.write_event(Event::Start(data))?;
        xml.write_event(Event::Text(BytesText::new(value)))?;
        xml.write_event(Event::End(BytesEnd::new("Data")))?;
        xml.write_event(Event::End(BytesEnd::new("Cell")))?;
    }
    xml.write_event(Event::End(BytesEnd::new("Row")))?;
    Ok(())
}
