//! Line-based reader for DIMACS CNF and Group CNF.
//!
//! `p cnf NVARS NCLAUSES` makes every clause its own soft group;
//! `p gcnf NVARS NCLAUSES NGROUPS` prefixes each clause with `{g}`, group 0
//! being the hard clauses. One clause per line, terminated by `0`.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use smallvec::SmallVec;
use varisat::Lit;

use super::{Clause, Instance, ParseError};

pub fn parse_file(path: &Path) -> Result<Instance, ParseError> {
    let io_err = |source| ParseError::Io {
        path: path.display().to_string(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        parse(BufReader::new(GzDecoder::new(file)))
    } else {
        parse(BufReader::new(file))
    }
}

struct Header {
    grouped: bool,
    num_vars: usize,
    num_clauses: usize,
    num_groups: u32,
}

pub fn parse(reader: impl BufRead) -> Result<Instance, ParseError> {
    let mut header: Option<Header> = None;
    let mut clauses: Vec<Clause> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|source| ParseError::Io {
            path: "<input>".to_string(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('c') {
            continue;
        }
        if line.starts_with('p') {
            let h = parse_header(line, line_no)?;
            groups = vec![Vec::new(); h.num_groups as usize + 1];
            clauses.reserve(h.num_clauses);
            header = Some(h);
            continue;
        }

        let header = header.as_ref().ok_or(ParseError::ClauseBeforeHeader { line: line_no })?;
        let mut tokens = line.split_ascii_whitespace();

        let group = if header.grouped {
            let token = tokens.next().unwrap_or_default();
            parse_group(token, line_no, header.num_groups)?
        } else {
            // plain CNF: clause i forms group i
            if clauses.len() >= header.num_clauses {
                return Err(ParseError::ClauseCountMismatch {
                    declared: header.num_clauses,
                    found: clauses.len() + 1,
                });
            }
            clauses.len() as u32 + 1
        };

        let clause = parse_clause(tokens, line_no, header.num_vars)?;
        groups[group as usize].push(clauses.len());
        clauses.push(clause);
    }

    let header = header.ok_or(ParseError::BadHeader { line: 0 })?;
    if clauses.len() != header.num_clauses {
        return Err(ParseError::ClauseCountMismatch {
            declared: header.num_clauses,
            found: clauses.len(),
        });
    }

    Ok(Instance {
        num_vars: header.num_vars,
        num_clauses: header.num_clauses,
        num_groups: header.num_groups,
        clauses,
        groups,
    })
}

fn parse_header(line: &str, line_no: usize) -> Result<Header, ParseError> {
    let bad = || ParseError::BadHeader { line: line_no };
    let mut tokens = line.split_ascii_whitespace();
    if tokens.next() != Some("p") {
        return Err(bad());
    }
    let grouped = match tokens.next() {
        Some("cnf") => false,
        Some("gcnf") => true,
        _ => return Err(bad()),
    };
    let num_vars: usize = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
    let num_clauses: usize = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
    let num_groups: u32 = if grouped {
        tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?
    } else {
        num_clauses as u32
    };
    Ok(Header {
        grouped,
        num_vars,
        num_clauses,
        num_groups,
    })
}

/// Parses the `{g}` prefix of a group CNF clause.
fn parse_group(token: &str, line_no: usize, num_groups: u32) -> Result<u32, ParseError> {
    let inner = token
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| ParseError::BadLiteral {
            line: line_no,
            token: token.to_string(),
        })?;
    let group: i64 = inner.parse().map_err(|_| ParseError::BadLiteral {
        line: line_no,
        token: token.to_string(),
    })?;
    if group < 0 || group > num_groups as i64 {
        return Err(ParseError::GroupOutOfRange {
            line: line_no,
            group,
            num_groups,
        });
    }
    Ok(group as u32)
}

fn parse_clause<'a>(
    tokens: impl Iterator<Item = &'a str>,
    line_no: usize,
    num_vars: usize,
) -> Result<Clause, ParseError> {
    let mut clause: Clause = SmallVec::new();
    let mut terminated = false;
    for token in tokens {
        if terminated {
            return Err(ParseError::MissingTerminator { line: line_no });
        }
        let value: isize = token.parse().map_err(|_| ParseError::BadLiteral {
            line: line_no,
            token: token.to_string(),
        })?;
        if value == 0 {
            terminated = true;
            continue;
        }
        let var = value.unsigned_abs();
        if var > num_vars {
            return Err(ParseError::VariableOutOfRange {
                line: line_no,
                var,
                num_vars,
            });
        }
        clause.push(Lit::from_dimacs(value));
    }
    if !terminated {
        return Err(ParseError::MissingTerminator { line: line_no });
    }
    Ok(clause)
}
