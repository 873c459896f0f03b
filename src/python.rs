//! PyO3 extension module exposing the tokenizer to Python.

use std::collections::{HashMap, HashSet};

use pyo3::{
    exceptions::{PyIOError, PyValueError},
    prelude::*,
};

use crate::{
    error::{ErrorMode, ModelIoError},
    tokenizer::{AllowedSpecial, Tokenizer},
    types::Token,
};

fn value_err(e: impl std::fmt::Display) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn model_err(e: ModelIoError) -> PyErr {
    match e {
        ModelIoError::Io(io) => PyIOError::new_err(io.to_string()),
        other => value_err(other),
    }
}

/// `allowed_special` as passed from Python: a mode name or a set of tokens.
#[derive(FromPyObject)]
enum PyAllowedSpecial {
    Mode(String),
    Set(HashSet<String>),
}

impl TryFrom<PyAllowedSpecial> for AllowedSpecial {
    type Error = PyErr;

    fn try_from(value: PyAllowedSpecial) -> Result<Self, Self::Error> {
        match value {
            PyAllowedSpecial::Mode(mode) => mode.parse().map_err(value_err),
            PyAllowedSpecial::Set(names) => Ok(AllowedSpecial::Set(names)),
        }
    }
}

/// Python wrapper for the byte-level BPE tokenizer.
#[pyclass(name = "Tokenizer")]
pub struct PyTokenizer {
    inner: Tokenizer,
}

#[pymethods]
impl PyTokenizer {
    /// `pattern=None` selects the GPT-4 split pattern, `""` disables chunking.
    #[new]
    #[pyo3(signature = (pattern = None))]
    fn new(pattern: Option<&str>) -> PyResult<Self> {
        let inner = match pattern {
            Some(p) => Tokenizer::with_pattern(p),
            None => Tokenizer::new(),
        }
        .map_err(value_err)?;
        Ok(Self { inner })
    }

    #[staticmethod]
    fn load(model_file: &str) -> PyResult<Self> {
        let inner = Tokenizer::load(model_file).map_err(model_err)?;
        Ok(Self { inner })
    }

    /// With `verbose`, every merge is logged at INFO on the `bytebpe` logger;
    /// `logging.basicConfig(level=logging.INFO)` prints them.
    #[pyo3(signature = (text, vocab_size, verbose = false))]
    fn train(&mut self, py: Python<'_>, text: &str, vocab_size: usize, verbose: bool) -> PyResult<()> {
        py.allow_threads(|| self.inner.train(text, vocab_size, verbose))
            .map_err(value_err)
    }

    fn register_special_tokens(&mut self, special_tokens: HashMap<String, Token>) -> PyResult<()> {
        self.inner
            .register_special_tokens(special_tokens)
            .map_err(value_err)
    }

    fn encode_ordinary(&self, py: Python<'_>, text: &str) -> PyResult<Vec<Token>> {
        py.allow_threads(|| self.inner.encode_ordinary(text))
            .map_err(value_err)
    }

    #[pyo3(signature = (text, allowed_special = None))]
    fn encode(
        &self,
        py: Python<'_>,
        text: &str,
        allowed_special: Option<PyAllowedSpecial>,
    ) -> PyResult<Vec<Token>> {
        let allowed = match allowed_special {
            Some(a) => AllowedSpecial::try_from(a)?,
            None => AllowedSpecial::default(),
        };
        py.allow_threads(|| self.inner.encode(text, &allowed))
            .map_err(value_err)
    }

    #[pyo3(signature = (texts, allowed_special = None, show_progress = false))]
    fn encode_batch(
        &self,
        py: Python<'_>,
        texts: Vec<String>,
        allowed_special: Option<PyAllowedSpecial>,
        show_progress: bool,
    ) -> PyResult<Vec<Vec<Token>>> {
        let allowed = match allowed_special {
            Some(a) => AllowedSpecial::try_from(a)?,
            None => AllowedSpecial::default(),
        };
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        py.allow_threads(|| self.inner.encode_batch(&refs, &allowed, show_progress))
            .map_err(value_err)
    }

    #[pyo3(signature = (ids, errors = "replace"))]
    fn decode(&self, ids: Vec<Token>, errors: &str) -> PyResult<String> {
        let mode: ErrorMode = errors.parse().map_err(value_err)?;
        self.inner.decode_with(&ids, mode).map_err(value_err)
    }

    #[pyo3(signature = (token_seqs, errors = "replace", show_progress = false))]
    fn decode_batch(
        &self,
        py: Python<'_>,
        token_seqs: Vec<Vec<Token>>,
        errors: &str,
        show_progress: bool,
    ) -> PyResult<Vec<String>> {
        let mode: ErrorMode = errors.parse().map_err(value_err)?;
        let refs: Vec<&[Token]> = token_seqs.iter().map(Vec::as_slice).collect();
        py.allow_threads(|| self.inner.decode_batch(&refs, mode, show_progress))
            .map_err(value_err)
    }

    fn save(&self, file_prefix: &str) -> PyResult<()> {
        self.inner.save(file_prefix).map_err(model_err)
    }

    #[getter]
    fn pattern(&self) -> &str {
        self.inner.pattern()
    }

    #[getter]
    fn special_tokens(&self) -> HashMap<String, Token> {
        self.inner.special_tokens().clone()
    }

    #[getter]
    fn merges(&self) -> Vec<((Token, Token), Token)> {
        self.inner
            .vocabulary()
            .merges()
            .iter()
            .map(|&(pair, id)| ((pair.0, pair.1), id))
            .collect()
    }

    #[getter]
    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }
}

#[pymodule]
fn _bytebpe(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // forward `log` records (verbose training) to Python's logging;
    // fails only if a logger is already installed
    let _ = pyo3_log::try_init();

    m.add_class::<PyTokenizer>()?;
    m.add("GPT2_SPLIT_PATTERN", crate::chunker::GPT2_SPLIT_PATTERN)?;
    m.add("GPT4_SPLIT_PATTERN", crate::chunker::GPT4_SPLIT_PATTERN)?;
    Ok(())
}
