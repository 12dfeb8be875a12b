use crate::options::ParseMode;

/// Parsing Options structure for the PE parser
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ParseOptions {
    /// Wether the parser should resolve rvas or not. Default: true
    ///
    /// Set to false when the buffer is a memory-mapped image, where an RVA already is
    /// the offset into the buffer.
    pub resolve_rva: bool,
    /// Whether or not to parse attribute certificates.
    /// Set to false for in-memory representation, as the [loader does not map this info into
    /// memory](https://learn.microsoft.com/en-us/windows/win32/debug/pe-format#other-contents-of-the-file).
    /// For on-disk representations, leave as true.
    /// Default: true
    pub parse_attribute_certificates: bool,
    /// Strict or permissive parsing. Default: [`ParseMode::Strict`]
    pub parse_mode: ParseMode,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            resolve_rva: true,
            parse_attribute_certificates: true,
            parse_mode: ParseMode::Strict,
        }
    }
}

impl ParseOptions {
    /// Returns a parse options structure with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Default options with [`ParseMode::Permissive`] recovery enabled
    pub fn permissive() -> Self {
        Self::default().with_parse_mode(ParseMode::Permissive)
    }

    pub fn with_parse_mode(mut self, parse_mode: ParseMode) -> Self {
        self.parse_mode = parse_mode;
        self
    }

    pub fn with_resolve_rva(mut self, resolve_rva: bool) -> Self {
        self.resolve_rva = resolve_rva;
        self
    }

    pub fn with_parse_attribute_certificates(mut self, parse: bool) -> Self {
        self.parse_attribute_certificates = parse;
        self
    }
}
