//! Node.js runtime surface: builtin-module tables, the deno std/node
//! mapping, browser polyfill packages, and embedded polyfill assets.

/// Builtin modules of the Node.js runtime, including the common
/// promise-flavoured subpaths.
const BUILTIN_NODE_MODULES: &[&str] = &[
    "assert",
    "assert/strict",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "diagnostics_channel",
    "dns",
    "dns/promises",
    "domain",
    "events",
    "fs",
    "fs/promises",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "path/posix",
    "path/win32",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "stream/promises",
    "stream/web",
    "string_decoder",
    "sys",
    "timers",
    "timers/promises",
    "tls",
    "trace_events",
    "tty",
    "url",
    "util",
    "util/types",
    "v8",
    "vm",
    "wasi",
    "worker_threads",
    "zlib",
];

/// Modules covered by the `std/node` compatibility layer of Deno.
const DENO_STD_NODE_MODULES: &[&str] = &[
    "assert",
    "buffer",
    "console",
    "constants",
    "crypto",
    "events",
    "fs",
    "module",
    "os",
    "path",
    "process",
    "querystring",
    "stream",
    "string_decoder",
    "timers",
    "tty",
    "url",
    "util",
];

/// Browser polyfill packages published on the registry, rebuilt as bundled
/// sub-artifacts when a non-node target imports the builtin.
const POLYFILLED_BUILTIN_NODE_MODULES: &[(&str, &str)] = &[
    ("assert", "assert"),
    ("constants", "constants-browserify"),
    ("crypto", "crypto-browserify"),
    ("domain", "domain-browser"),
    ("events", "events"),
    ("http", "stream-http"),
    ("https", "https-browserify"),
    ("os", "os-browserify/browser"),
    ("path", "path-browserify"),
    ("punycode", "punycode"),
    ("querystring", "querystring-es3"),
    ("stream", "stream-browserify"),
    ("string_decoder", "string_decoder"),
    ("sys", "util"),
    ("timers", "timers-browserify"),
    ("tty", "tty-browserify"),
    ("url", "url"),
    ("util", "util"),
    ("vm", "vm-browserify"),
    ("zlib", "browserify-zlib"),
];

/// Whether `name` is a builtin module of the Node.js runtime.
pub fn is_builtin_node_module(name: &str) -> bool {
    BUILTIN_NODE_MODULES.contains(&name)
}

/// Whether `name` is covered by Deno's `std/node` compatibility layer.
pub fn is_deno_std_node_module(name: &str) -> bool {
    DENO_STD_NODE_MODULES.contains(&name)
}

/// The registry polyfill package for a builtin, if one is published.
pub fn polyfilled_builtin(name: &str) -> Option<&'static str> {
    POLYFILLED_BUILTIN_NODE_MODULES
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(_, polyfill)| *polyfill)
}

/// An embedded polyfill asset for a builtin, served by the front-end as
/// `/v<N>/node_<name>.js`. The engine only needs existence to decide the
/// rewrite; the bytes are exposed for the host to serve.
pub fn embedded_polyfill(name: &str) -> Option<&'static str> {
    match name {
        "buffer" => Some(include_str!("embed/polyfills/node_buffer.js")),
        "process" => Some(include_str!("embed/polyfills/node_process.js")),
        "timers" => Some(include_str!("embed/polyfills/node_timers.js")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        assert!(is_builtin_node_module("fs"));
        assert!(is_builtin_node_module("fs/promises"));
        assert!(is_builtin_node_module("child_process"));
        assert!(!is_builtin_node_module("react"));
        assert!(!is_builtin_node_module("node:fs"));
    }

    #[test]
    fn test_deno_std_lookup() {
        assert!(is_deno_std_node_module("fs"));
        assert!(is_deno_std_node_module("path"));
        assert!(!is_deno_std_node_module("child_process"));
    }

    #[test]
    fn test_polyfilled_builtin() {
        assert_eq!(polyfilled_builtin("path"), Some("path-browserify"));
        assert_eq!(polyfilled_builtin("zlib"), Some("browserify-zlib"));
        assert_eq!(polyfilled_builtin("wasi"), None);
    }

    #[test]
    fn test_embedded_polyfill() {
        assert!(embedded_polyfill("process").is_some());
        assert!(embedded_polyfill("buffer").is_some());
        assert!(embedded_polyfill("cluster").is_none());
    }
}
