//! # Module for File IO (Parsing and Writing)
//!
//! As the submodules have different APIs, it is recommended to parse through
//! [`load_path`] or the per-format entry points rather than using the parser
//! internals directly.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use anyhow::Context;

use crate::instances::{Config, Wcsp};

pub mod cfn;
pub mod dimacs;
pub mod opb;
pub mod qpbo;
pub mod uai;
pub mod wcsp;

/// The supported surface formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// JSON-like cost function network
    Cfn,
    /// Legacy WCSP
    Wcsp,
    /// UAI Markov / Bayesian network with linear probability tables
    Uai,
    /// UAI with log10 probability tables
    Lg,
    /// DIMACS weighted CNF
    Wcnf,
    /// DIMACS CNF
    Cnf,
    /// Quadratic pseudo-Boolean
    Qpbo,
    /// Linear pseudo-Boolean
    Opb,
}

impl Format {
    /// Guesses the format from a file name, looking past compression
    /// extensions
    #[must_use]
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Format> {
        let name = path.as_ref().file_name()?.to_str()?;
        let name = name
            .strip_suffix(".gz")
            .or_else(|| name.strip_suffix(".bz2"))
            .unwrap_or(name);
        let ext = name.rsplit('.').next()?;
        match ext {
            "cfn" | "json" => Some(Format::Cfn),
            "wcsp" => Some(Format::Wcsp),
            "uai" => Some(Format::Uai),
            "LG" | "lg" => Some(Format::Lg),
            "wcnf" => Some(Format::Wcnf),
            "cnf" => Some(Format::Cnf),
            "qpbo" => Some(Format::Qpbo),
            "opb" => Some(Format::Opb),
            _ => None,
        }
    }
}

/// Loads a network from a file, guessing the format from the extension.
/// With feature `compression` supports bzip2 and gzip compressed input.
///
/// # Errors
///
/// Parsing errors, [`io::Error`], or an unrecognised extension.
pub fn load_path<P: AsRef<Path>>(path: P, config: &Config) -> anyhow::Result<Wcsp> {
    let path = path.as_ref();
    let format = Format::from_path(path)
        .with_context(|| format!("cannot guess instance format of {}", path.display()))?;
    let reader = BufReader::new(open_compressed_uncompressed_read(path)?);
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unnamed");
    load_reader(reader, format, name, config)
        .with_context(|| format!("while parsing {}", path.display()))
}

/// Loads a network from a reader in the given format
///
/// # Errors
///
/// Parsing errors or [`io::Error`].
pub fn load_reader<R: BufRead>(
    reader: R,
    format: Format,
    name: &str,
    config: &Config,
) -> anyhow::Result<Wcsp> {
    match format {
        Format::Cfn => cfn::parse(reader, config),
        Format::Wcsp => wcsp::parse(reader, config),
        Format::Uai => uai::parse(reader, name, false, config),
        Format::Lg => uai::parse(reader, name, true, config),
        Format::Wcnf => dimacs::parse_wcnf(reader, name, config),
        Format::Cnf => dimacs::parse_cnf(reader, name, config),
        Format::Qpbo => qpbo::parse(reader, name, config),
        Format::Opb => opb::parse(reader, name, config),
    }
}

/// Opens a reader for the file at Path.
/// With feature `compression` supports bzip2 and gzip compression.
pub(crate) fn open_compressed_uncompressed_read<P: AsRef<Path>>(
    path: P,
) -> Result<Box<dyn io::Read>, io::Error> {
    let path = path.as_ref();
    let raw_reader = File::open(path)?;
    #[cfg(feature = "compression")]
    if let Some(ext) = path.extension() {
        if ext.eq_ignore_ascii_case(std::ffi::OsStr::new("bz2")) {
            return Ok(Box::new(bzip2::read::BzDecoder::new(raw_reader)));
        }
        if ext.eq_ignore_ascii_case(std::ffi::OsStr::new("gz")) {
            return Ok(Box::new(flate2::read::GzDecoder::new(raw_reader)));
        }
    }
    Ok(Box::new(raw_reader))
}

/// A lazy line-buffered whitespace tokenizer shared by the token-shaped
/// parsers (CFN, legacy WCSP, UAI). In punctuation mode braces, brackets,
/// commas and colons become tokens of their own and `#`/`//` comments are
/// stripped; otherwise lines are split on whitespace only and `#` comments
/// are stripped.
#[derive(Debug)]
pub(crate) struct TokenReader<R> {
    reader: R,
    line: Vec<String>,
    pos: usize,
    line_num: usize,
    punctuation: bool,
}

impl<R: BufRead> TokenReader<R> {
    pub(crate) fn new(reader: R, punctuation: bool) -> Self {
        TokenReader {
            reader,
            line: vec![],
            pos: 0,
            line_num: 0,
            punctuation,
        }
    }

    fn split_line(&mut self, buffer: &str) {
        self.line.clear();
        self.pos = 0;
        let buffer = match buffer.find('#') {
            Some(idx) => &buffer[..idx],
            None => buffer,
        };
        let buffer = if self.punctuation {
            match buffer.find("//") {
                Some(idx) => &buffer[..idx],
                None => buffer,
            }
        } else {
            buffer
        };
        if self.punctuation {
            let mut current = String::new();
            for c in buffer.chars() {
                match c {
                    '{' | '}' | '[' | ']' | ',' | ':' => {
                        if !current.is_empty() {
                            self.line.push(std::mem::take(&mut current));
                        }
                        self.line.push(String::from(c));
                    }
                    c if c.is_whitespace() => {
                        if !current.is_empty() {
                            self.line.push(std::mem::take(&mut current));
                        }
                    }
                    '"' => (),
                    c => current.push(c),
                }
            }
            if !current.is_empty() {
                self.line.push(current);
            }
        } else {
            self.line
                .extend(buffer.split_whitespace().map(String::from));
        }
    }

    /// The next token with its line number, or `None` at end of input
    pub(crate) fn next_token(&mut self) -> io::Result<Option<(usize, String)>> {
        while self.pos >= self.line.len() {
            let mut buffer = String::new();
            if self.reader.read_line(&mut buffer)? == 0 {
                return Ok(None);
            }
            self.line_num += 1;
            self.split_line(&buffer);
        }
        let token = self.line[self.pos].clone();
        self.pos += 1;
        Ok(Some((self.line_num, token)))
    }

    /// Peeks at the next token without consuming it
    pub(crate) fn peek(&mut self) -> io::Result<Option<(usize, String)>> {
        while self.pos >= self.line.len() {
            let mut buffer = String::new();
            if self.reader.read_line(&mut buffer)? == 0 {
                return Ok(None);
            }
            self.line_num += 1;
            self.split_line(&buffer);
        }
        Ok(Some((self.line_num, self.line[self.pos].clone())))
    }

    /// The line number of the most recently read line
    pub(crate) fn line_num(&self) -> usize {
        self.line_num
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{Format, TokenReader};

    #[test]
    fn format_guessing() {
        assert_eq!(Format::from_path("a/b/queens.wcsp"), Some(Format::Wcsp));
        assert_eq!(Format::from_path("net.cfn.gz"), Some(Format::Cfn));
        assert_eq!(Format::from_path("grid.uai"), Some(Format::Uai));
        assert_eq!(Format::from_path("grid.LG"), Some(Format::Lg));
        assert_eq!(Format::from_path("inst.opb"), Some(Format::Opb));
        assert_eq!(Format::from_path("README"), None);
    }

    #[test]
    fn plain_tokens() {
        let mut reader = TokenReader::new(Cursor::new("a b # comment\n\n c\n"), false);
        let mut tokens = vec![];
        while let Some((_, tok)) = reader.next_token().unwrap() {
            tokens.push(tok);
        }
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[test]
    fn punctuation_tokens() {
        let input = "{ \"name\" : test, // trailing\n [1,2] }";
        let mut reader = TokenReader::new(Cursor::new(input), true);
        let mut tokens = vec![];
        while let Some((_, tok)) = reader.next_token().unwrap() {
            tokens.push(tok);
        }
        assert_eq!(
            tokens,
            vec!["{", "name", ":", "test", ",", "[", "1", ",", "2", "]", "}"]
        );
    }
}
