//! A small JavaScript scanner that classifies a module's export kind and
//! collects its top-level named exports. It does not build a syntax tree;
//! it walks the source once, skipping comments and string literals, and
//! only interprets `import`/`export` statements at brace depth zero.

/// How a module exposes its bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportsKind {
    /// No imports or exports detected
    None,
    /// `require`/`module.exports` style
    CommonJs,
    /// `import`/`export` statements
    Esm,
}

/// Result of scanning one module source.
#[derive(Debug, Clone)]
pub struct ModuleSummary {
    pub kind: ExportsKind,
    /// Top-level named exports, in source order
    pub named_exports: Vec<String>,
    /// Whether a `default` export was seen
    pub has_default: bool,
}

/// Identifier characters, matching the bundler's identifier rules.
pub fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    depth: i32,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    /// Skip whitespace, comments, and punctuation that carries no meaning
    /// for the scan, tracking brace depth. Stops at the start of an
    /// identifier, a string literal, or end of input.
    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b'/' if self.peek_at(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek_at(1) == Some(b'*') => self.skip_block_comment(),
                b'\'' | b'"' => self.skip_string(c),
                b'`' => self.skip_template(),
                b'{' => {
                    self.depth += 1;
                    self.pos += 1;
                }
                b'}' => {
                    self.depth -= 1;
                    self.pos += 1;
                }
                c if is_ident_char(c) => break,
                _ => self.pos += 1,
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == b'\n' {
                break;
            }
        }
    }

    fn skip_block_comment(&mut self) {
        self.pos += 2;
        while self.pos < self.src.len() {
            if self.peek() == Some(b'*') && self.peek_at(1) == Some(b'/') {
                self.pos += 2;
                return;
            }
            self.pos += 1;
        }
    }

    fn skip_string(&mut self, quote: u8) {
        self.pos += 1;
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == b'\\' {
                self.pos += 1;
            } else if c == quote {
                break;
            }
        }
    }

    // Template interpolation nests arbitrary expressions; a depth counter
    // over `${`..`}` is enough for keyword detection.
    fn skip_template(&mut self) {
        self.pos += 1;
        let mut braces = 0;
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                b'\\' => self.pos += 1,
                b'$' if self.peek() == Some(b'{') => {
                    self.pos += 1;
                    braces += 1;
                }
                b'}' if braces > 0 => braces -= 1,
                b'`' if braces == 0 => break,
                _ => {}
            }
        }
    }

    fn read_word(&mut self) -> Option<&'a str> {
        self.skip_trivia();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_ident_char(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos > start {
            Some(std::str::from_utf8(&self.src[start..self.pos]).unwrap_or(""))
        } else {
            None
        }
    }

    /// The next meaningful byte without consuming it.
    fn peek_meaningful(&mut self) -> Option<u8> {
        let mut probe = self.pos;
        while let Some(&c) = self.src.get(probe) {
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => probe += 1,
                b'/' if self.src.get(probe + 1) == Some(&b'/') => {
                    while let Some(&c) = self.src.get(probe) {
                        probe += 1;
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                _ => return Some(c),
            }
        }
        None
    }
}

/// Scan a module source and summarise its export shape.
pub fn scan_module(source: &str) -> ModuleSummary {
    let mut scanner = Scanner::new(source);
    let mut summary = ModuleSummary {
        kind: ExportsKind::None,
        named_exports: Vec::new(),
        has_default: false,
    };
    let mut cjs_evidence = false;
    let mut esm_evidence = false;

    while let Some(word) = scanner.read_word() {
        let top_level = scanner.depth == 0;
        match word {
            "import" if top_level => {
                // `import(` is a dynamic import and `import.meta` a meta
                // property; neither marks the module ESM by itself.
                match scanner.peek_meaningful() {
                    Some(b'(') | Some(b'.') => {}
                    _ => esm_evidence = true,
                }
            }
            "export" if top_level => {
                esm_evidence = true;
                scan_export(&mut scanner, &mut summary);
            }
            "require" => {
                if scanner.peek_meaningful() == Some(b'(') {
                    cjs_evidence = true;
                }
            }
            "module" => {
                if scanner.peek_meaningful() == Some(b'.') {
                    cjs_evidence = true;
                }
            }
            "exports" if top_level => {
                if matches!(scanner.peek_meaningful(), Some(b'.') | Some(b'[')) {
                    cjs_evidence = true;
                }
            }
            _ => {}
        }
    }

    summary.kind = if esm_evidence {
        ExportsKind::Esm
    } else if cjs_evidence {
        ExportsKind::CommonJs
    } else {
        ExportsKind::None
    };
    summary
}

fn scan_export(scanner: &mut Scanner<'_>, summary: &mut ModuleSummary) {
    match scanner.peek_meaningful() {
        Some(b'{') => {
            // export { a, b as c, default as d } [from "..."]
            scanner.skip_trivia(); // consumes the `{`, raising depth
            loop {
                let Some(name) = scanner.read_word() else { break };
                let mut exported = name.to_string();
                if scanner.peek_meaningful().map(|c| is_ident_char(c)) == Some(true) {
                    // possible `as` alias
                    let save = scanner.pos;
                    if scanner.read_word() == Some("as") {
                        if let Some(alias) = scanner.read_word() {
                            exported = alias.to_string();
                        }
                    } else {
                        scanner.pos = save;
                    }
                }
                if exported == "default" {
                    summary.has_default = true;
                } else {
                    summary.named_exports.push(exported);
                }
                match scanner.peek_meaningful() {
                    Some(b',') => {
                        scanner.pos += 1;
                        continue;
                    }
                    _ => break,
                }
            }
        }
        Some(b'*') => {
            // export * from "..." / export * as ns from "..."
            scanner.pos += 1;
            let save = scanner.pos;
            if scanner.read_word() == Some("as") {
                if let Some(ns) = scanner.read_word() {
                    summary.named_exports.push(ns.to_string());
                }
            } else {
                scanner.pos = save;
            }
        }
        _ => {
            let Some(word) = scanner.read_word() else { return };
            match word {
                "default" => summary.has_default = true,
                "const" | "let" | "var" | "function" | "class" => {
                    declared_name(scanner, summary);
                }
                "async" => {
                    if scanner.read_word() == Some("function") {
                        declared_name(scanner, summary);
                    }
                }
                _ => {}
            }
        }
    }
}

fn declared_name(scanner: &mut Scanner<'_>, summary: &mut ModuleSummary) {
    // `function*` generators have a star before the name
    if scanner.peek_meaningful() == Some(b'*') {
        scanner.pos += 1;
    }
    if let Some(name) = scanner.read_word() {
        if !name.is_empty() {
            summary.named_exports.push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esm_detection() {
        let s = scan_module("import React from 'react';\nexport default React;");
        assert_eq!(s.kind, ExportsKind::Esm);
        assert!(s.has_default);
    }

    #[test]
    fn test_named_exports() {
        let s = scan_module(
            "export const version = '1.0';\nexport function render(el) {}\nexport class Widget {}\nexport { internal as external };",
        );
        assert_eq!(s.kind, ExportsKind::Esm);
        assert_eq!(
            s.named_exports,
            vec!["version", "render", "Widget", "external"]
        );
        assert!(!s.has_default);
    }

    #[test]
    fn test_export_clause_default_alias() {
        let s = scan_module("const impl = 1;\nexport { impl as default, impl as named };");
        assert!(s.has_default);
        assert_eq!(s.named_exports, vec!["named"]);
    }

    #[test]
    fn test_cjs_detection() {
        let s = scan_module("const path = require('path');\nmodule.exports = { join: path.join };");
        assert_eq!(s.kind, ExportsKind::CommonJs);
    }

    #[test]
    fn test_exports_assignment() {
        let s = scan_module("exports.parse = function () {};");
        assert_eq!(s.kind, ExportsKind::CommonJs);
    }

    #[test]
    fn test_keywords_in_strings_ignored() {
        let s = scan_module("const s = \"export default nothing\";\nconst t = `require('x') ${1}`;");
        assert_eq!(s.kind, ExportsKind::None);
    }

    #[test]
    fn test_keywords_in_comments_ignored() {
        let s = scan_module("// export default x\n/* import y from 'z' */\nvar a = 1;");
        assert_eq!(s.kind, ExportsKind::None);
    }

    #[test]
    fn test_nested_export_not_top_level() {
        let s = scan_module("function f() {\n  const exports = {};\n  exports.a = 1;\n}\nmodule.exports = f;");
        assert_eq!(s.kind, ExportsKind::CommonJs);
        assert!(s.named_exports.is_empty());
    }

    #[test]
    fn test_dynamic_import_is_not_esm() {
        let s = scan_module("const mod = import('thing');\nmodule.exports = mod;");
        assert_eq!(s.kind, ExportsKind::CommonJs);
    }

    #[test]
    fn test_export_star() {
        let s = scan_module("export * from './other';\nexport * as helpers from './helpers';");
        assert_eq!(s.kind, ExportsKind::Esm);
        assert_eq!(s.named_exports, vec!["helpers"]);
    }
}
