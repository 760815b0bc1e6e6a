use serde::Deserialize;

/// Page-side counters for DOM mutations and history navigation.
///
/// The observer lives in the page and only counts; the host polls the
/// counters and turns increments into broadcast signals. A full page load
/// wipes the counters, which shows up as `active: false` on the next poll, or
/// as a new `document` token when the observer was reinstalled in between.
pub struct ElementMonitor {
    last: Option<MonitorSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub active: bool,
    #[serde(default)]
    pub mutations: u64,
    #[serde(default)]
    pub history: u64,
    /// Random token minted when the observer is installed into a document.
    #[serde(default)]
    pub document: Option<String>,
}

/// What changed between two polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorDelta {
    pub mutated: bool,
    pub navigated: bool,
    /// A load replaced the document, possibly at the same URL.
    pub replaced: bool,
    /// The observer is gone and must be installed again.
    pub needs_install: bool,
}

impl ElementMonitor {
    pub fn new() -> Self {
        Self { last: None }
    }

    pub fn install_script() -> &'static str {
        r#"
            (function() {
                if (window.__remixMonitor) {
                    return JSON.stringify({ installed: false });
                }
                const state = {
                    mutations: 0,
                    history: 0,
                    document: Date.now().toString(36) + Math.random().toString(36).slice(2)
                };
                window.__remixMonitor = state;

                const observer = new MutationObserver((mutations) => {
                    // Nodes we create ourselves do not count as page changes
                    const external = mutations.some((m) => {
                        const target = m.target;
                        return !(target && target.nodeType === 1 && target.hasAttribute('data-remix-id'));
                    });
                    if (external) {
                        state.mutations++;
                    }
                });
                observer.observe(document.documentElement, {
                    childList: true,
                    subtree: true,
                    attributes: true,
                    characterData: false
                });

                const bump = () => { state.history++; };
                for (const method of ['pushState', 'replaceState']) {
                    const original = history[method];
                    history[method] = function(...args) {
                        const result = original.apply(this, args);
                        bump();
                        return result;
                    };
                }
                window.addEventListener('popstate', bump);
                window.addEventListener('hashchange', bump);

                return JSON.stringify({ installed: true });
            })()
        "#
    }

    pub fn poll_script() -> &'static str {
        r#"
            (function() {
                const state = window.__remixMonitor;
                if (!state) {
                    return JSON.stringify({ active: false });
                }
                return JSON.stringify({
                    active: true,
                    mutations: state.mutations,
                    history: state.history,
                    document: state.document
                });
            })()
        "#
    }

    /// Compare a fresh snapshot with the previous one.
    pub fn observe(&mut self, snapshot: MonitorSnapshot) -> MonitorDelta {
        let had_observer = self.last.as_ref().map_or(false, |last| last.active);

        if !snapshot.active {
            self.last = None;
            return MonitorDelta {
                mutated: had_observer,
                navigated: false,
                replaced: had_observer,
                needs_install: true,
            };
        }

        let delta = match self.last.as_ref() {
            Some(last) if last.active && last.document != snapshot.document => MonitorDelta {
                mutated: true,
                navigated: false,
                replaced: true,
                needs_install: false,
            },
            Some(last) if last.active => MonitorDelta {
                mutated: snapshot.mutations != last.mutations,
                navigated: snapshot.history != last.history,
                replaced: false,
                needs_install: false,
            },
            _ => MonitorDelta::default(),
        };
        self.last = Some(snapshot);
        delta
    }
}

impl Default for ElementMonitor {
    fn default() -> Self {
        Self::new()
    }
}
