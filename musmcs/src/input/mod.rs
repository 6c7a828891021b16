//! Input model: a (group) CNF formula with its soft-group structure.

pub mod dimacs;

use std::collections::BTreeSet;
use std::path::Path;

use smallvec::SmallVec;
use thiserror::Error;
use varisat::Lit;

/// A clause body, in problem-variable space.
pub type Clause = SmallVec<[Lit; 8]>;

/// A parsed formula, partitioned into hard clauses (group 0) and `num_groups`
/// selectable soft groups. This is the read-only input shared by every
/// worker; nothing mutates it after parsing.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Number of problem variables declared in the header.
    pub num_vars: usize,
    /// Total number of clauses.
    pub num_clauses: usize,
    /// Number of soft groups (`n`). For plain CNF input this equals
    /// `num_clauses`, each clause forming its own group.
    pub num_groups: u32,
    /// All clause bodies, in input order.
    pub clauses: Vec<Clause>,
    /// `groups[g]` lists the indices (into `clauses`) of group `g`;
    /// `groups[0]` are the hard clauses.
    pub groups: Vec<Vec<usize>>,
}

impl Instance {
    /// The full set of soft-group identifiers, `1..=n`.
    pub fn all_groups(&self) -> BTreeSet<u32> {
        (1..=self.num_groups).collect()
    }

    /// Parse a `.cnf`/`.gcnf` file, transparently decompressing `.gz` inputs.
    pub fn from_path(path: &Path) -> Result<Instance, ParseError> {
        dimacs::parse_file(path)
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: missing or malformed problem header")]
    BadHeader { line: usize },
    #[error("line {line}: clause before the problem header")]
    ClauseBeforeHeader { line: usize },
    #[error("line {line}: clause does not end with 0")]
    MissingTerminator { line: usize },
    #[error("line {line}: malformed literal {token:?}")]
    BadLiteral { line: usize, token: String },
    #[error("line {line}: variable {var} exceeds the declared {num_vars} variables")]
    VariableOutOfRange { line: usize, var: usize, num_vars: usize },
    #[error("line {line}: group {group} out of range (expected 0..={num_groups})")]
    GroupOutOfRange { line: usize, group: i64, num_groups: u32 },
    #[error("header declares {declared} clauses but the file contains {found}")]
    ClauseCountMismatch { declared: usize, found: usize },
}
