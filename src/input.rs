use std::fs::File;
use std::io::{self, BufReader, Read};

use bio::io::fasta;
use camino::Utf8Path;
use flate2::read::MultiGzDecoder;
use tracing::info;

use crate::domain::ProteinRecord;
use crate::error::CdsError;

/// Loads protein records from a FASTA file, `-` for stdin, or a `.gz` file.
pub fn load_proteins(path: &Utf8Path) -> Result<Vec<ProteinRecord>, CdsError> {
    let reader: Box<dyn Read> = if path.as_str() == "-" {
        Box::new(io::stdin().lock())
    } else {
        let file = File::open(path.as_std_path()).map_err(|err| CdsError::InputRead {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        if path.extension() == Some("gz") {
            Box::new(MultiGzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(file)
        }
    };
    let records = read_proteins(reader, path.as_str())?;
    info!(path = %path, records = records.len(), "loaded input proteins");
    Ok(records)
}

pub fn read_proteins<R: Read>(reader: R, source: &str) -> Result<Vec<ProteinRecord>, CdsError> {
    let mut proteins = Vec::new();
    for (index, record) in fasta::Reader::new(reader).records().enumerate() {
        let record = record.map_err(|err| CdsError::InputRead {
            path: source.to_string(),
            message: err.to_string(),
        })?;
        if let Err(message) = record.check() {
            return Err(CdsError::InputParse {
                index: index + 1,
                id: record.id().to_string(),
                message: message.to_string(),
            });
        }
        proteins.push(ProteinRecord::new(
            record.id(),
            record.desc().unwrap_or_default(),
            record.seq(),
        ));
    }
    Ok(proteins)
}
