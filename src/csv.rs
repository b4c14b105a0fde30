use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::amount::AmountParseError;

/// Errors that can occur when parsing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized request type '{request_type}'")]
    UnrecognizedType { line: usize, request_type: String },

    #[error("line {line}: {request_type} missing amount")]
    MissingAmount { line: usize, request_type: String },

    #[error("line {line}: invalid amount: {source}")]
    InvalidAmount {
        line: usize,
        source: AmountParseError,
    },
}

/// One request of a replay file; accounts are referred to by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open { account: String, balance: Amount },
    Deposit { account: String, amount: Amount },
    Withdraw { account: String, amount: Amount },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    account: String,
    amount: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    account: &'a str,
    balance: String,
    entries: usize,
}

fn parse_amount(line: usize, raw: &str) -> Result<Amount, CsvError> {
    raw.parse()
        .map_err(|source| CsvError::InvalidAmount { line, source })
}

fn require_amount(
    line: usize,
    request_type: &str,
    raw: Option<String>,
) -> Result<Amount, CsvError> {
    let raw = raw.ok_or_else(|| CsvError::MissingAmount {
        line,
        request_type: request_type.to_string(),
    })?;
    parse_amount(line, &raw)
}

/// Read requests from a csv file
pub fn read_requests(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Request, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| parse_row(idx + 2, result))) // 1-indexed, skip header
}

fn parse_row(line: usize, result: Result<InputRow, csv::Error>) -> Result<Request, CsvError> {
    let row = result.map_err(|source| CsvError::Parse { line, source })?;
    let account = row.account;
    match row.r#type.as_str() {
        "open" => {
            // opening without an amount starts from zero
            let balance = match row.amount {
                Some(raw) => parse_amount(line, &raw)?,
                None => Amount::ZERO,
            };
            Ok(Request::Open { account, balance })
        }
        "deposit" => Ok(Request::Deposit {
            account,
            amount: require_amount(line, "deposit", row.amount)?,
        }),
        "withdraw" | "withdrawal" => Ok(Request::Withdraw {
            account,
            amount: require_amount(line, "withdraw", row.amount)?,
        }),
        other => Err(CsvError::UnrecognizedType {
            line,
            request_type: other.to_string(),
        }),
    }
}

/// write account report to stdout in csv format
pub fn write_accounts<'a>(
    accounts: impl IntoIterator<Item = (&'a str, Amount, usize)>,
) -> Result<(), csv::Error> {
    write_accounts_to(io::stdout().lock(), accounts)
}

fn write_accounts_to<'a, W: io::Write>(
    out: W,
    accounts: impl IntoIterator<Item = (&'a str, Amount, usize)>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);

    for (account, balance, entries) in accounts {
        writer.serialize(OutputRow {
            account,
            balance: balance.to_string(),
            entries,
        })?;
    }

    writer.flush()?;
    Ok(())
}
