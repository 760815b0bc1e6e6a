//! Page-side snippets. Every snippet evaluates to a JSON string so results
//! survive the trip through the DevTools protocol unchanged.

use crate::core::{ELEMENT_ID_BINDING, MARKER_ATTRIBUTE};
use serde_json::Value;

/// Encode `value` as a JavaScript string literal.
fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

pub struct PageScripts;

impl PageScripts {
    /// Installs `find`, `findAll`, `findByText`, `closest` and `callAssistant`
    /// once per document; the global flag makes repeated installs no-ops.
    pub fn helpers(bridge_timeout_ms: u64) -> String {
        format!(
            r#"
            (function() {{
                if (window.__remixHelpersInstalled) {{
                    return JSON.stringify({{ installed: false }});
                }}
                window.__remixHelpersInstalled = true;

                const asList = (selectors) => Array.isArray(selectors) ? selectors : [selectors];

                const find = (selectors, root) => {{
                    for (const selector of asList(selectors)) {{
                        try {{
                            const found = (root || document).querySelector(selector);
                            if (found) return found;
                        }} catch (e) {{
                            // Invalid selector: try the next one
                        }}
                    }}
                    return null;
                }};

                const findAll = (selectors, root) => {{
                    for (const selector of asList(selectors)) {{
                        try {{
                            const found = (root || document).querySelectorAll(selector);
                            if (found.length > 0) return Array.from(found);
                        }} catch (e) {{}}
                    }}
                    return [];
                }};

                // Direct text first, so an ancestor never wins over the real target
                const findByText = (text, tag) => {{
                    const needle = String(text).trim().toLowerCase();
                    const candidates = Array.from(document.querySelectorAll(tag || '*'));
                    const ownText = (el) => Array.from(el.childNodes)
                        .filter((n) => n.nodeType === Node.TEXT_NODE)
                        .map((n) => n.textContent)
                        .join(' ')
                        .trim()
                        .toLowerCase();
                    const direct = candidates.find((el) => ownText(el).includes(needle));
                    if (direct) return direct;
                    const nested = candidates.filter((el) => (el.textContent || '').toLowerCase().includes(needle));
                    return nested.length ? nested[nested.length - 1] : null;
                }};

                const closest = (node, selectors) => {{
                    if (!node) return null;
                    for (const selector of asList(selectors)) {{
                        try {{
                            const found = node.closest(selector);
                            if (found) return found;
                        }} catch (e) {{}}
                    }}
                    return null;
                }};

                window.__remixOutbox = window.__remixOutbox || [];
                window.__remixPending = window.__remixPending || {{}};
                let nextCallId = 1;

                const callAssistant = (prompt, options) => new Promise((resolve, reject) => {{
                    const opts = options || {{}};
                    const id = nextCallId++;
                    const timeoutMs = opts.timeoutMs || {timeout};
                    const timer = setTimeout(() => {{
                        delete window.__remixPending[id];
                        reject(new Error('callAssistant timed out after ' + timeoutMs + 'ms'));
                    }}, timeoutMs);
                    window.__remixPending[id] = {{ resolve, reject, timer }};
                    window.__remixOutbox.push({{
                        id: id,
                        prompt: String(prompt),
                        system: opts.system || null,
                        timeoutMs: timeoutMs
                    }});
                }});

                Object.assign(window, {{ find, findAll, findByText, closest, callAssistant }});
                return JSON.stringify({{ installed: true }});
            }})()
            "#,
            timeout = bridge_timeout_ms
        )
    }

    /// Run generated code in its own async function scope with the element id
    /// bound, so it may `await`. Exceptions and rejections are caught and
    /// reported, never rethrown. Evaluate with promise awaiting on.
    pub fn run(owner: &str, js: &str) -> String {
        format!(
            r#"
            (async function() {{
                try {{
                    await (async function({binding}) {{
{js}
                    }})({owner});
                    return JSON.stringify({{ ok: true }});
                }} catch (e) {{
                    return JSON.stringify({{ ok: false, error: String((e && e.message) || e) }});
                }}
            }})()
            "#,
            binding = ELEMENT_ID_BINDING,
            owner = js_string(owner),
            js = js
        )
    }

    pub fn insert_style(owner: &str, css: &str) -> String {
        format!(
            r#"
            (function() {{
                const style = document.createElement('style');
                style.setAttribute({attr}, {owner});
                style.textContent = {css};
                (document.head || document.documentElement).appendChild(style);
                return JSON.stringify(true);
            }})()
            "#,
            attr = js_string(MARKER_ATTRIBUTE),
            owner = js_string(owner),
            css = js_string(css)
        )
    }

    /// Marked nodes other than engine-owned style tags.
    pub fn count_marked(marker: &str) -> String {
        format!(
            r#"
            (function() {{
                const count = Array.from(document.querySelectorAll('[' + {attr} + ']'))
                    .filter((el) => el.getAttribute({attr}) === {marker} && el.tagName !== 'STYLE')
                    .length;
                return JSON.stringify(count);
            }})()
            "#,
            attr = js_string(MARKER_ATTRIBUTE),
            marker = js_string(marker)
        )
    }

    pub fn remove_marked(marker: &str) -> String {
        format!(
            r#"
            (function() {{
                const nodes = Array.from(document.querySelectorAll('[' + {attr} + ']'))
                    .filter((el) => el.getAttribute({attr}) === {marker});
                nodes.forEach((el) => el.remove());
                return JSON.stringify(nodes.length);
            }})()
            "#,
            attr = js_string(MARKER_ATTRIBUTE),
            marker = js_string(marker)
        )
    }

    /// Marked nodes other than engine-owned style tags, removed.
    pub fn remove_created(marker: &str) -> String {
        format!(
            r#"
            (function() {{
                const nodes = Array.from(document.querySelectorAll('[' + {attr} + ']'))
                    .filter((el) => el.getAttribute({attr}) === {marker} && el.tagName !== 'STYLE');
                nodes.forEach((el) => el.remove());
                return JSON.stringify(nodes.length);
            }})()
            "#,
            attr = js_string(MARKER_ATTRIBUTE),
            marker = js_string(marker)
        )
    }

    pub fn remove_all_marked() -> String {
        format!(
            r#"
            (function() {{
                const nodes = Array.from(document.querySelectorAll('[' + {attr} + ']'));
                nodes.forEach((el) => el.remove());
                return JSON.stringify(nodes.length);
            }})()
            "#,
            attr = js_string(MARKER_ATTRIBUTE)
        )
    }

    pub fn document_html() -> &'static str {
        "JSON.stringify(document.documentElement ? document.documentElement.outerHTML : '')"
    }

    pub fn title() -> &'static str {
        "JSON.stringify(document.title || '')"
    }

    /// Drain queued `callAssistant` requests.
    pub fn take_assistant_calls() -> &'static str {
        r#"
        (function() {
            const calls = window.__remixOutbox || [];
            window.__remixOutbox = [];
            return JSON.stringify(calls);
        })()
        "#
    }

    pub fn settle_assistant_call(id: u64, result: &std::result::Result<String, String>) -> String {
        let (ok, payload) = match result {
            Ok(text) => (true, js_string(text)),
            Err(error) => (false, js_string(error)),
        };
        format!(
            r#"
            (function() {{
                const pending = (window.__remixPending || {{}})[{id}];
                if (!pending) return JSON.stringify(false);
                clearTimeout(pending.timer);
                delete window.__remixPending[{id}];
                if ({ok}) {{
                    pending.resolve({payload});
                }} else {{
                    pending.reject(new Error({payload}));
                }}
                return JSON.stringify(true);
            }})()
            "#
        )
    }
}
