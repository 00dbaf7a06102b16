use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize the record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("CSV headers must be written before any records")]
    CsvHeadersAfterRecords,
}

impl Args {
    pub fn is_streaming(&self) -> bool {
        !matches!(self.format, Format::Table)
    }

    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match &self.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Ok(Output { args: self, io, formatter })
    }
}

pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl Output {
    pub fn table_headers(&mut self, hdrs: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                if *written_records {
                    return Err(Error::CsvHeadersAfterRecords);
                }
                *written_records = true;
                self.write_csv_row(&hdrs)?;
            }
            Formatter::Table { comfy } => {
                comfy.set_header(hdrs);
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: std::ops::Deref<Target = str>>(
        &mut self,
        values: &[V],
    ) -> Result<(), Error> {
        // Quoting at most doubles a field, plus the surrounding quotes.
        let max_len = 2 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        for (index, value) in values.iter().enumerate() {
            if index != 0 {
                let (_, ob) = writer.delimiter(&mut output);
                self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
            }
            let (result, _, ob) = writer.field(value.as_bytes(), &mut output);
            debug_assert_eq!(result, WriteResult::InputEmpty);
            self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
        }
        let (_, ob) = writer.terminator(&mut output);
        self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))
    }

    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    /// Output a structured record about `subject`.
    ///
    /// Tabular formats get one `subject, field, value` row per leaf of the record, JSONL a single
    /// `{"subject": .., "record": ..}` line.
    pub fn record<R: serde::Serialize>(&mut self, subject: &str, record: &R) -> Result<(), Error> {
        #[derive(serde::Serialize)]
        struct Line<'a, R> {
            subject: &'a str,
            record: &'a R,
        }
        if let Formatter::Jsonl = self.formatter {
            return self.result(Vec::new, || Line { subject, record });
        }
        let value = serde_json::to_value(record).map_err(Error::SerializeJson)?;
        for (field, value) in flatten(&value) {
            self.result(|| vec![subject.to_string(), field, value], || ())?;
        }
        Ok(())
    }

    /// Push out everything written so far. Tables are only printed on [`Output::commit`].
    pub fn flush(&mut self) -> Result<(), Error> {
        self.io.flush().map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        match &self.formatter {
            Formatter::Csv { written_records: _ } => {}
            Formatter::Table { comfy } => {
                self.io.write_fmt(format_args!("{}\n", comfy)).map_err(|e| self.write_error(e))?;
            }
            Formatter::Jsonl => {}
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

/// Flatten a serialized record into `(dotted.path, value)` pairs for tabular output.
///
/// `null` values are rendered as empty strings.
pub fn flatten(value: &serde_json::Value) -> Vec<(String, String)> {
    fn walk(prefix: String, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
        let join = |key: &dyn std::fmt::Display| {
            if prefix.is_empty() { key.to_string() } else { format!("{prefix}.{key}") }
        };
        match value {
            serde_json::Value::Object(map) => {
                for (key, value) in map {
                    walk(join(key), value, out);
                }
            }
            serde_json::Value::Array(items) => {
                for (index, value) in items.iter().enumerate() {
                    walk(join(&index), value, out);
                }
            }
            serde_json::Value::Null => out.push((prefix, String::new())),
            serde_json::Value::String(s) => out.push((prefix, s.clone())),
            other => out.push((prefix, other.to_string())),
        }
    }
    let mut out = Vec::new();
    walk(String::new(), value, &mut out);
    out
}
