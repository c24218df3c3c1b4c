use std::fmt::{self, Write};
use std::ops::Range;

use rand::Rng;

pub const CSV_HEADER: &str = "Name;Email;Phone;Address;";

/// Renders the bytes of one report.
pub trait ReportContent: Send + Sync + fmt::Debug {
    fn render(&self) -> Vec<u8>;

    fn extension(&self) -> &'static str;
}

/// Semicolon-separated contact list with a random number of rows.
#[derive(Debug, Clone)]
pub struct CsvReport {
    rows: Range<usize>,
}

impl CsvReport {
    pub fn new() -> Self {
        Self { rows: 10..1000 }
    }

    pub fn with_rows(rows: Range<usize>) -> Self {
        Self { rows }
    }
}

impl Default for CsvReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportContent for CsvReport {
    fn render(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let count = if self.rows.is_empty() {
            self.rows.start
        } else {
            rng.gen_range(self.rows.clone())
        };

        let mut out = String::with_capacity(64 * (count + 1));
        out.push_str(CSV_HEADER);
        out.push('\n');
        for n in 0..count {
            let id: u32 = rng.gen_range(1000..10000);
            // Writing into a String cannot fail.
            let _ = writeln!(
                out,
                "User {id};user{id}.{n}@example.com;+1-555-{:04};{} Main Street;",
                rng.gen_range(0..10000),
                rng.gen_range(1..1000),
            );
        }
        out.into_bytes()
    }

    fn extension(&self) -> &'static str {
        "csv"
    }
}
