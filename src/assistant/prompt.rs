use crate::assistant::client::ChatMessage;
use crate::assistant::conversation::ConversationEntry;
use crate::assistant::elements::Element;
use crate::core::{ELEMENT_ID_BINDING, MARKER_ATTRIBUTE};
use crate::dom::{FragmentResult, PageContext};
use std::fmt::Write;

pub fn system_instructions(max_selectors: usize) -> String {
    format!(
        r#"You customize the web page the user is looking at. You receive a simplified snapshot of the page, the customizations that already exist on it, and the conversation so far.

Always answer with ONE JSON object and nothing else, in one of these shapes:
1. {{"message": "..."}} for a plain answer or question.
2. {{"message": "...", "element": {{"name": "...", "description": "...", "js": "...", "css": "..."}}}} to create a new customization.
3. {{"message": "...", "element": {{"elementId": "<existing id>", "name": "...", "description": "...", "js": "...", "css": "..."}}}} to update an existing one. Omit "js" or "css" to keep that half unchanged. Never resend identical code and call it a change.
4. {{"message": "...", "inspect": ["selector", ...]}} to see the HTML of up to {max_selectors} parts of the page before answering. Use the outline and landmark selectors for this.

Rules for generated code:
- The code runs in its own function scope after the page has loaded. `{binding}` holds the id of the element the code belongs to.
- Tag every node you create with `node.setAttribute('{marker}', {binding})`. Nodes without the tag are not cleaned up, and code that creates no tagged node is treated as failed and retried.
- Helpers available on window: find(selectors), findAll(selectors), findByText(text, tag), closest(node, selectors), and callAssistant(prompt, {{system, timeoutMs}}) which returns a Promise of the model's text.
- Prefer the verified selectors listed under landmarks. Pass several fallback selectors to find() instead of relying on one.
- Do not remove or rewrite page content you did not create."#,
        marker = MARKER_ATTRIBUTE,
        binding = ELEMENT_ID_BINDING,
    )
}

pub fn page_context_message(context: &PageContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Current page: {}", context.url);
    let _ = writeln!(out, "Title: {}", context.title);

    if !context.landmarks.is_empty() {
        out.push_str("\nLandmarks (verified selectors):\n");
        for landmark in &context.landmarks {
            let _ = writeln!(out, "- {}: {}", landmark.label, landmark.selectors.join(", "));
        }
    }

    if !context.outline.is_empty() {
        let _ = write!(out, "\nOutline:\n{}\n", context.outline);
    }

    if context.truncated {
        let _ = writeln!(
            out,
            "\nThe HTML below is cut short ({} characters in full). Use \"inspect\" with selectors from the outline to see the rest.",
            context.html_length
        );
    }
    let _ = write!(out, "\nSimplified HTML:\n{}", context.simplified_html);
    out
}

/// Existing customizations with their full code, so untouched halves can be kept.
pub fn existing_elements_message(elements: &[Element]) -> Option<String> {
    if elements.is_empty() {
        return None;
    }
    let mut out = String::from("Customizations already on this page:\n");
    for element in elements {
        let _ = write!(
            out,
            "\n## {} (elementId: {}){}\n{}\n",
            element.name,
            element.id,
            if element.enabled { "" } else { " [disabled]" },
            element.description
        );
        let _ = write!(out, "JS:\n```js\n{}\n```\n", element.code.js);
        let _ = write!(out, "CSS:\n```css\n{}\n```\n", element.code.css);
    }
    Some(out)
}

pub fn fragments_message(fragments: &[FragmentResult], rounds_left: u32) -> String {
    let mut out = String::from("Requested page content:\n");
    for result in fragments {
        match result {
            FragmentResult::Found(fragment) => {
                let _ = write!(
                    out,
                    "\n### {} (<{}>, {} children{})\n{}\n",
                    fragment.selector,
                    fragment.tag,
                    fragment.child_count,
                    if fragment.truncated {
                        format!(", truncated from {} characters", fragment.total_length)
                    } else {
                        String::new()
                    },
                    fragment.html
                );
            }
            FragmentResult::Failed { selector, error } => {
                let _ = write!(out, "\n### {selector}\nError: {error}\n");
            }
        }
    }
    if rounds_left == 0 {
        out.push_str(
            "\nNo more inspection rounds are available. Answer now with a message or an element.",
        );
    } else {
        let _ = write!(out, "\nYou may inspect {rounds_left} more time(s).");
    }
    out
}

/// Ordered request: instructions, page context, existing elements, history,
/// then the new prompt.
pub fn build_request(
    max_selectors: usize,
    context: &PageContext,
    existing: &[Element],
    history: &[ConversationEntry],
    user_prompt: &str,
) -> Vec<ChatMessage> {
    let mut messages = vec![
        ChatMessage::system(system_instructions(max_selectors)),
        ChatMessage::system(page_context_message(context)),
    ];
    if let Some(existing) = existing_elements_message(existing) {
        messages.push(ChatMessage::system(existing));
    }
    messages.extend(history.iter().map(ConversationEntry::to_message));
    messages.push(ChatMessage::user(user_prompt));
    messages
}
