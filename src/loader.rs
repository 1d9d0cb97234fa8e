//! Grammar file formats.
//!
//! A grammar is a line-oriented text file. Lines starting with `#` and
//! blank lines are ignored everywhere. The layout is:
//!
//! ```text
//! symbols.db              classifier prototype database
//! symbols.types           symbol-type annotations
//! Expr                    nonterminal names ...
//! Term
//! START
//! Expr                    start symbols ...
//! PTERM
//! Term digits.txt         terminal productions: nonterminal and class table
//! PBIN
//! 1.0 H Expr Term Term "$1$2"            binary rules
//! 0.5 V Expr Term Term "\frac{$1}{$2}" AAB
//! ```
//!
//! Paths are relative to the grammar file's directory. Binary rule lines
//! are split on whitespace, with double quotes grouping a token that may
//! contain spaces. `V` and `Vs` rules carry a trailing three-character
//! baseline merge string.
//!
//! A terminal class table starts with the number of entries, followed by
//! `"<prior> <class> <output>"` lines.

use crate::relation::{MergeFlags, Relation};
use log::warn;
use std::fs;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;
use thiserror::Error;

/// Errors loading a grammar and its resources.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("grammar file is empty")]
    EmptyGrammar,
    #[error("grammar ends before {0}")]
    MissingSection(&'static str),
    #[error("line {line}: nonterminal '{name}' not defined")]
    UndefinedNonterminal { line: usize, name: String },
    #[error("line {line}: malformed rule: {reason}")]
    MalformedRule { line: usize, reason: String },
    #[error("line {line}: invalid rule type '{kind}'")]
    UnknownRelation { line: usize, kind: String },
    #[error("line {line}: invalid number '{text}'")]
    InvalidNumber { line: usize, text: String },
    #[error("symbol database, line {line}: {reason}")]
    ClassifierDatabase { line: usize, reason: String },
}

impl LoadError {
    /// Attach a grammar line number to an error raised without one.
    pub fn at_line(self, line: usize) -> Self {
        match self {
            LoadError::UndefinedNonterminal { name, .. } => {
                LoadError::UndefinedNonterminal { line, name }
            }
            LoadError::MalformedRule { reason, .. } => LoadError::MalformedRule { line, reason },
            other => other,
        }
    }
}

/// Result type for loading operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Read a whole text file.
pub fn read_text(path: &Path) -> LoadResult<String> {
    fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// A terminal production declaration: `nonterminal` draws its classes from
/// the table at `table`.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalDecl {
    pub line: usize,
    pub nonterminal: String,
    pub table: PathBuf,
}

/// A binary rule line.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDecl {
    pub line: usize,
    pub prior: f64,
    pub relation: Relation,
    pub parent: String,
    pub left: String,
    pub right: String,
    pub template: String,
    pub merge: Option<MergeFlags>,
}

/// A grammar file, split into its sections. Names are not resolved yet.
#[derive(Debug, Clone, PartialEq)]
pub struct GrammarFile {
    pub classifier_db: PathBuf,
    pub symbol_types: PathBuf,
    /// `(line, name)` in declaration order.
    pub nonterminals: Vec<(usize, String)>,
    pub start: Vec<(usize, String)>,
    pub terminals: Vec<TerminalDecl>,
    pub rules: Vec<RuleDecl>,
}

/// One entry of a terminal class table.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalLine {
    pub line: usize,
    pub prior: f64,
    pub class: String,
    pub output: String,
}

/// Content lines with their 1-based line numbers.
fn content_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.starts_with('#') && !line.trim().is_empty())
}

/// Split a rule line into tokens. A double quote starts a token that runs
/// to the next double quote, whitespace included.
struct Tokenizer<'a> {
    input: Peekable<Chars<'a>>,
}

impl<'a> Tokenizer<'a> {
    fn new(line: &'a str) -> Self {
        Tokenizer {
            input: line.chars().peekable(),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.input.peek().is_some_and(|c| c.is_whitespace()) {
            self.input.next();
        }
    }

    fn read_while<F: Fn(char) -> bool>(&mut self, predicate: F) -> String {
        let mut result = String::new();
        while let Some(&c) = self.input.peek() {
            if !predicate(c) {
                break;
            }
            result.push(c);
            self.input.next();
        }
        result
    }
}

impl Iterator for Tokenizer<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.skip_whitespace();
        match self.input.peek()? {
            '"' => {
                self.input.next();
                let token = self.read_while(|c| c != '"');
                self.input.next();
                Some(token)
            }
            _ => Some(self.read_while(|c| !c.is_whitespace())),
        }
    }
}

/// Tokenize a binary rule line.
pub fn tokenize(line: &str) -> Vec<String> {
    Tokenizer::new(line).collect()
}

fn first_word(line: &str) -> String {
    line.split_whitespace().next().unwrap_or_default().to_string()
}

fn parse_rule(line: usize, text: &str) -> LoadResult<RuleDecl> {
    let mut tokens = tokenize(text);
    let malformed = |reason: String| LoadError::MalformedRule { line, reason };

    if tokens.len() != 6 && tokens.len() != 7 {
        return Err(malformed(format!("expected 6 or 7 fields, found {}", tokens.len())));
    }

    let relation = Relation::from_name(&tokens[1]).ok_or_else(|| LoadError::UnknownRelation {
        line,
        kind: tokens[1].clone(),
    })?;

    let merge = if relation.takes_merge_flags() {
        let flags = tokens
            .get(6)
            .ok_or_else(|| malformed(format!("{} rule needs a merge string", relation)))?;
        let parsed = MergeFlags::parse(flags)
            .ok_or_else(|| malformed(format!("merge string '{}' is too short", flags)))?;
        Some(parsed)
    } else if tokens.len() == 7 {
        return Err(malformed(format!("{} rule takes no merge string", relation)));
    } else {
        None
    };

    let prior = tokens[0].parse::<f64>().map_err(|_| LoadError::InvalidNumber {
        line,
        text: tokens[0].clone(),
    })?;

    tokens.truncate(6);
    let template = tokens.pop().unwrap_or_default();
    let right = tokens.pop().unwrap_or_default();
    let left = tokens.pop().unwrap_or_default();
    let parent = tokens.pop().unwrap_or_default();

    Ok(RuleDecl {
        line,
        prior,
        relation,
        parent,
        left,
        right,
        template,
        merge,
    })
}

/// Split a grammar file into its sections.
///
/// Resource paths are resolved against `base_dir`.
pub fn parse_grammar(text: &str, base_dir: &Path) -> LoadResult<GrammarFile> {
    let mut lines = content_lines(text);

    let (_, db) = lines.next().ok_or(LoadError::EmptyGrammar)?;
    let (_, types) = lines.next().ok_or(LoadError::MissingSection("symbol types"))?;

    let mut nonterminals = Vec::new();
    let mut start = Vec::new();
    let mut terminals = Vec::new();
    let mut rules = Vec::new();

    let mut section_until = |marker: &'static str, out: &mut Vec<(usize, String)>| {
        for (line, text) in lines.by_ref() {
            if text.trim() == marker {
                return Ok(());
            }
            out.push((line, text.to_string()));
        }
        Err(LoadError::MissingSection(marker))
    };

    let mut raw = Vec::new();
    section_until("START", &mut raw)?;
    nonterminals.extend(raw.drain(..).map(|(line, text)| (line, first_word(&text))));

    section_until("PTERM", &mut raw)?;
    start.extend(raw.drain(..).map(|(line, text)| (line, first_word(&text))));

    section_until("PBIN", &mut raw)?;
    for (line, text) in raw.drain(..) {
        let mut fields = text.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(nt), Some(path)) => terminals.push(TerminalDecl {
                line,
                nonterminal: nt.to_string(),
                table: base_dir.join(path),
            }),
            _ => {
                return Err(LoadError::MalformedRule {
                    line,
                    reason: "terminal production needs a nonterminal and a file".to_string(),
                })
            }
        }
    }

    for (line, text) in lines {
        rules.push(parse_rule(line, text)?);
    }

    Ok(GrammarFile {
        classifier_db: base_dir.join(db.trim()),
        symbol_types: base_dir.join(types.trim()),
        nonterminals,
        start,
        terminals,
        rules,
    })
}

/// Parse a terminal class table.
///
/// Entries beyond the declared count are ignored. A table shorter than
/// declared, or an entry with fewer than three fields, is reported and
/// skipped.
pub fn parse_terminal_table(text: &str) -> LoadResult<Vec<TerminalLine>> {
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));

    let (line, header) = lines.next().unwrap_or((1, ""));
    let header = header.trim();
    let count: usize = header
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| LoadError::InvalidNumber {
            line,
            text: header.to_string(),
        })?;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let Some((line, text)) = lines.next() else {
            warn!("terminal table declares {} classes but has {}", count, entries.len());
            break;
        };

        let mut fields = text.split_whitespace();
        let (Some(prior), Some(class), Some(output)) = (fields.next(), fields.next(), fields.next())
        else {
            warn!("terminal table line {} is incomplete: '{}'", line, text);
            continue;
        };

        let prior = prior.parse::<f64>().map_err(|_| LoadError::InvalidNumber {
            line,
            text: prior.to_string(),
        })?;
        entries.push(TerminalLine {
            line,
            prior,
            class: class.to_string(),
            output: output.to_string(),
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAMMAR: &str = "\
# toy grammar
symbols.db
symbols.types

Expr
Term
START
Expr
PTERM
Term digits.txt
Expr digits.txt
PBIN
1.0 H Expr Term Term \"$1$2\"
# fractions
0.5 V Expr Term Term \"\\frac{$1}{$2}\" AAB
0.25 Sup Expr Term Term \"$1^{ $2 }\"
";

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("  1.0 H S A B $1$2\n"), vec!["1.0", "H", "S", "A", "B", "$1$2"]);
        assert_eq!(
            tokenize("1 H S A B \"$1 + $2\""),
            vec!["1", "H", "S", "A", "B", "$1 + $2"]
        );
        assert_eq!(tokenize("\"\" x"), vec!["", "x"]);
        assert_eq!(tokenize("\"open ended"), vec!["open ended"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_parse_grammar_sections() {
        let g = parse_grammar(GRAMMAR, Path::new("/data/g")).unwrap();

        assert_eq!(g.classifier_db, PathBuf::from("/data/g/symbols.db"));
        assert_eq!(g.symbol_types, PathBuf::from("/data/g/symbols.types"));
        assert_eq!(
            g.nonterminals,
            vec![(5, "Expr".to_string()), (6, "Term".to_string())]
        );
        assert_eq!(g.start, vec![(8, "Expr".to_string())]);
        assert_eq!(g.terminals.len(), 2);
        assert_eq!(g.terminals[0].nonterminal, "Term");
        assert_eq!(g.terminals[0].table, PathBuf::from("/data/g/digits.txt"));

        assert_eq!(g.rules.len(), 3);
        let h = &g.rules[0];
        assert_eq!(h.line, 13);
        assert_eq!(h.relation, Relation::Horizontal);
        assert_eq!((h.parent.as_str(), h.left.as_str(), h.right.as_str()), ("Expr", "Term", "Term"));
        assert_eq!(h.template, "$1$2");
        assert_eq!(h.merge, None);

        let v = &g.rules[1];
        assert_eq!(v.relation, Relation::Below);
        assert_eq!(v.template, "\\frac{$1}{$2}");
        assert_eq!(
            v.merge,
            Some(MergeFlags {
                sup: true,
                hor: true,
                sub: false
            })
        );
        assert!((v.prior - 0.5).abs() < 1e-12);

        assert_eq!(g.rules[2].template, "$1^{ $2 }");
    }

    #[test]
    fn test_parse_grammar_errors() {
        assert!(matches!(
            parse_grammar("# only comments\n\n", Path::new("")),
            Err(LoadError::EmptyGrammar)
        ));
        assert!(matches!(
            parse_grammar("a.db\nb.types\nExpr\n", Path::new("")),
            Err(LoadError::MissingSection("START"))
        ));

        let head = "a.db\nb.types\nE\nSTART\nE\nPTERM\nPBIN\n";
        let err = parse_grammar(&format!("{}1.0 H E E\n", head), Path::new("")).unwrap_err();
        assert!(matches!(err, LoadError::MalformedRule { line: 8, .. }));

        let err = parse_grammar(&format!("{}1.0 Diag E E E x\n", head), Path::new("")).unwrap_err();
        assert!(matches!(err, LoadError::UnknownRelation { ref kind, .. } if kind == "Diag"));

        let err = parse_grammar(&format!("{}1.0 V E E E x\n", head), Path::new("")).unwrap_err();
        assert!(matches!(err, LoadError::MalformedRule { .. }));

        let err = parse_grammar(&format!("{}1.0 V E E E x AB\n", head), Path::new("")).unwrap_err();
        assert!(matches!(err, LoadError::MalformedRule { .. }));

        let err = parse_grammar(&format!("{}1.0 H E E E x AAA\n", head), Path::new("")).unwrap_err();
        assert!(matches!(err, LoadError::MalformedRule { .. }));

        let err = parse_grammar(&format!("{}high H E E E x\n", head), Path::new("")).unwrap_err();
        assert!(matches!(err, LoadError::InvalidNumber { line: 8, .. }));
    }

    #[test]
    fn test_parse_terminal_table() {
        let table = "3\n0.8 five 5\n0.2 s S\n1 alpha \\alpha\nextra line ignored\n";
        let entries = parse_terminal_table(table).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].class, "five");
        assert_eq!(entries[0].output, "5");
        assert!((entries[0].prior - 0.8).abs() < 1e-12);
        assert_eq!(entries[2].output, "\\alpha");
        assert_eq!(entries[2].line, 4);
    }

    #[test]
    fn test_parse_terminal_table_short() {
        let entries = parse_terminal_table("4\n0.5 a a\nbroken\n").unwrap();
        assert_eq!(entries.len(), 1);

        assert!(matches!(
            parse_terminal_table("many\n"),
            Err(LoadError::InvalidNumber { line: 1, .. })
        ));
        assert!(matches!(
            parse_terminal_table("1\nx a a\n"),
            Err(LoadError::InvalidNumber { line: 2, .. })
        ));
    }

    #[test]
    fn test_at_line() {
        let err = LoadError::UndefinedNonterminal {
            line: 0,
            name: "X".into(),
        }
        .at_line(12);
        assert_eq!(err.to_string(), "line 12: nonterminal 'X' not defined");
    }
}
