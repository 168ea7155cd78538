use std::io::{self, Write};

use bio::io::fasta;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::app::{MatchResult, RunReport, RunSummary};
use crate::config::OutputNames;
use crate::domain::ProteinRecord;
use crate::error::CdsError;
use crate::store::write_bytes_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputPaths {
    pub protein: Utf8PathBuf,
    pub nucleotide: Utf8PathBuf,
    pub skipped: Utf8PathBuf,
}

/// Writes the matched protein, matched CDS and skipped collections.
/// `records` must be the input the report was produced from.
pub fn write_outputs(
    outdir: &Utf8Path,
    names: &OutputNames,
    records: &[ProteinRecord],
    report: &RunReport,
) -> Result<OutputPaths, CdsError> {
    let paths = OutputPaths {
        protein: names.protein_path(outdir),
        nucleotide: names.nucleotide_path(outdir),
        skipped: names.skipped_path(outdir),
    };

    let mut proteins = Vec::new();
    let mut nucleotides = Vec::new();
    let mut skipped = Vec::new();
    for result in &report.results {
        let record = records.get(result.index).ok_or_else(|| {
            CdsError::Filesystem(format!("result #{} has no input record", result.index))
        })?;
        match result.matched() {
            Some(matched) => {
                proteins.push(protein_entry(record));
                nucleotides.push(FastaEntry {
                    id: &matched.output_id,
                    description: Some("coding sequence"),
                    sequence: matched.cds.as_bytes(),
                });
            }
            None => skipped.push(protein_entry(record)),
        }
    }

    for (path, entries) in [
        (&paths.protein, proteins),
        (&paths.nucleotide, nucleotides),
        (&paths.skipped, skipped),
    ] {
        write_bytes_atomic(path, &render_fasta(&entries)?)?;
        info!(path = %path, records = entries.len(), "wrote output");
    }
    Ok(paths)
}

struct FastaEntry<'a> {
    id: &'a str,
    description: Option<&'a str>,
    sequence: &'a [u8],
}

fn protein_entry(record: &ProteinRecord) -> FastaEntry<'_> {
    FastaEntry {
        id: &record.id,
        description: (!record.description.is_empty()).then_some(record.description.as_str()),
        sequence: &record.sequence,
    }
}

fn render_fasta(entries: &[FastaEntry<'_>]) -> Result<Vec<u8>, CdsError> {
    let mut buffer = Vec::new();
    {
        let mut writer = fasta::Writer::new(&mut buffer);
        for entry in entries {
            writer
                .write(entry.id, entry.description, entry.sequence)
                .map_err(fs_error)?;
        }
        writer.flush().map_err(fs_error)?;
    }
    Ok(buffer)
}

fn fs_error(err: impl std::fmt::Display) -> CdsError {
    CdsError::Filesystem(err.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutput<'a> {
    pub summary: &'a RunSummary,
    pub outputs: &'a OutputPaths,
    pub results: &'a [MatchResult],
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(report: &RunReport, outputs: &OutputPaths) -> io::Result<()> {
        Self::print_json(&RunOutput {
            summary: &report.summary,
            outputs,
            results: &report.results,
        })
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_summary(summary: &RunSummary, outputs: &OutputPaths) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(stdout, "{}", summary_text(summary))?;
        writeln!(stdout, "proteins:    {}", outputs.protein)?;
        writeln!(stdout, "nucleotides: {}", outputs.nucleotide)?;
        writeln!(stdout, "skipped:     {}", outputs.skipped)?;
        Ok(())
    }
}

pub fn summary_text(summary: &RunSummary) -> String {
    let mut text = format!(
        "{} records: {} matched, {} skipped",
        summary.total,
        summary.matched,
        summary.skipped_total()
    );
    for (reason, count) in &summary.skipped {
        text.push_str(&format!("\n  {reason}: {count}"));
    }
    if summary.cancelled {
        text.push_str("\n  (run interrupted; unissued lookups were skipped)");
    }
    text
}
