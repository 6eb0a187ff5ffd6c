//! Chromium-backed [`LoginPage`]
//!
//! Launches a local Chromium via the DevTools protocol. Element checks and
//! clicks are done with small page scripts that only consider rendered
//! elements, since the sign-in pages keep hidden copies of most controls.

use super::{LoginPage, PageError};
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Idle limit for the DevTools connection; must outlast the manual login wait
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(600);

/// Installed before any page script runs: without WebAuthn the sign-in page
/// falls back to the code prompt instead of a native security-key dialog
const DISABLE_WEBAUTHN_SCRIPT: &str = "delete window.PublicKeyCredential;
if (navigator.credentials) {
    navigator.credentials.get = () => Promise.reject(new Error('disabled'));
    navigator.credentials.create = () => Promise.reject(new Error('disabled'));
}";

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,
    pub proxy: Option<String>,
    pub user_agent: String,
}

pub struct ChromePage {
    tab: Arc<Tab>,
    // Dropping the browser closes the Chromium process
    _browser: Browser,
}

impl ChromePage {
    pub fn launch(settings: &BrowserSettings) -> Result<Self, PageError> {
        let mut args = vec![
            "--disable-blink-features=AutomationControlled".to_string(),
            "--no-sandbox".to_string(),
        ];
        if let Some(proxy) = &settings.proxy {
            args.push(format!("--proxy-server={}", proxy));
        }
        let os_args: Vec<&OsStr> = args.iter().map(OsStr::new).collect();

        let options = LaunchOptions::default_builder()
            .headless(settings.headless)
            .sandbox(false)
            .ignore_certificate_errors(true)
            .window_size(Some((1100, 900)))
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .args(os_args)
            .build()
            .map_err(|e| PageError::Browser(e.to_string()))?;

        debug!(
            "Launching Chromium (headless: {}, proxy: {:?})",
            settings.headless, settings.proxy
        );
        let browser = Browser::new(options).map_err(browser_error)?;
        let tab = browser.new_tab().map_err(browser_error)?;
        tab.set_user_agent(&settings.user_agent, None, None)
            .map_err(browser_error)?;
        tab.call_method(Page::AddScriptToEvaluateOnNewDocument {
            source: DISABLE_WEBAUTHN_SCRIPT.to_string(),
            world_name: None,
            include_command_line_api: None,
            run_immediately: None,
        })
        .map_err(browser_error)?;

        Ok(Self {
            tab,
            _browser: browser,
        })
    }

    fn eval_bool(&self, script: &str) -> Result<bool, PageError> {
        let result = self.tab.evaluate(script, false).map_err(browser_error)?;
        match result.value {
            Some(Value::Bool(b)) => Ok(b),
            other => Err(PageError::Script(format!("{:?}", other))),
        }
    }
}

fn browser_error(e: impl std::fmt::Display) -> PageError {
    PageError::Browser(e.to_string())
}

fn js_string(s: &str) -> String {
    // A JSON string literal is a valid JS string literal
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Script that runs `action` on the first rendered match of `selector`
/// and evaluates to whether such an element existed
fn with_first_visible(selector: &str, action: &str) -> String {
    format!(
        "(() => {{
            const el = [...document.querySelectorAll({sel})]
                .find(e => e.offsetParent !== null
                    && getComputedStyle(e).visibility !== 'hidden');
            if (!el) return false;
            {action}
            return true;
        }})()",
        sel = js_string(selector),
        action = action,
    )
}

/// Script that clicks the element whose own text contains `text`,
/// falling back to any small rendered element mentioning it
fn click_text_script(text: &str, exclude: &str) -> String {
    format!(
        "(() => {{
            const text = {text};
            const exclude = {exclude};
            const els = document.querySelectorAll('div, a, button, li, span, p');
            for (const el of els) {{
                const direct = [...el.childNodes]
                    .filter(n => n.nodeType === 3)
                    .map(n => n.textContent.trim())
                    .join(' ');
                if (direct.includes(text) && !direct.includes(exclude)) {{
                    const target = el.closest('[data-value], [role=button], a, button') || el;
                    target.click();
                    return true;
                }}
            }}
            for (const el of els) {{
                const all = el.textContent || '';
                if (all.includes(text) && !all.includes(exclude)
                    && el.offsetParent !== null && el.children.length < 5) {{
                    el.click();
                    return true;
                }}
            }}
            return false;
        }})()",
        text = js_string(text),
        exclude = js_string(exclude),
    )
}

impl LoginPage for ChromePage {
    fn open(&mut self, url: &str) -> Result<(), PageError> {
        self.tab.navigate_to(url).map_err(browser_error)?;
        self.tab.wait_until_navigated().map_err(browser_error)?;
        Ok(())
    }

    fn is_visible(&mut self, selector: &str) -> Result<bool, PageError> {
        self.eval_bool(&with_first_visible(selector, ""))
    }

    fn fill(&mut self, selector: &str, text: &str) -> Result<(), PageError> {
        let focused = self.eval_bool(&with_first_visible(
            selector,
            "el.focus(); el.value = '';",
        ))?;
        if !focused {
            return Err(PageError::Browser(format!("no element for {}", selector)));
        }
        // Real key events, so the page's own input handlers see the value
        self.tab.type_str(text).map_err(browser_error)?;
        Ok(())
    }

    fn click(&mut self, selector: &str) -> Result<(), PageError> {
        if self.eval_bool(&with_first_visible(selector, "el.click();"))? {
            Ok(())
        } else {
            Err(PageError::Browser(format!("no element for {}", selector)))
        }
    }

    fn click_text(&mut self, text: &str, exclude: &str) -> Result<bool, PageError> {
        self.eval_bool(&click_text_script(text, exclude))
    }

    fn cookie(&mut self, name: &str) -> Result<Option<String>, PageError> {
        let cookies = self.tab.get_cookies().map_err(browser_error)?;
        Ok(cookies
            .into_iter()
            .find(|c| c.name == name && !c.value.is_empty())
            .map(|c| c.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_string_escapes_quotes() {
        assert_eq!(
            js_string(r#"input[name="loginfmt"]"#),
            r#""input[name=\"loginfmt\"]""#
        );
    }

    #[test]
    fn test_with_first_visible_embeds_selector_and_action() {
        let script = with_first_visible("#idSIButton9", "el.click();");
        assert!(script.contains(r##"querySelectorAll("#idSIButton9")"##));
        assert!(script.contains("el.click();"));
        assert!(script.contains("return true;"));
    }

    #[test]
    fn test_click_text_script_quotes_arguments() {
        let script = click_text_script("Use a verification code", "Approve");
        assert!(script.contains(r#"const text = "Use a verification code";"#));
        assert!(script.contains(r#"const exclude = "Approve";"#));
    }

    #[test]
    fn test_webauthn_script_removes_security_key_api() {
        assert!(DISABLE_WEBAUTHN_SCRIPT.contains("delete window.PublicKeyCredential;"));
        for method in ["get", "create"] {
            let stub = format!(
                "navigator.credentials.{} = () => Promise.reject(new Error('disabled'));",
                method
            );
            assert!(DISABLE_WEBAUTHN_SCRIPT.contains(&stub), "missing stub for {}", method);
        }
        // Guarded, so pages without a credentials container do not throw
        assert!(DISABLE_WEBAUTHN_SCRIPT.contains("if (navigator.credentials)"));
    }
}
