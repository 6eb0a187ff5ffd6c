//! SSO login flow
//!
//! Drives the identity provider's sign-in pages until the VPN gateway issues
//! its session cookie. The page sequence is modelled as a state machine over
//! [`Step`]; each state has one transition function returning a
//! [`Transition`]. Page access goes through the [`LoginPage`] trait so the
//! flow can run against a real browser ([`chrome::ChromePage`]) or a
//! scripted fake.
//!
//! # Page sequence
//!
//! 1. identity → Next
//! 2. password → Sign in
//! 3. "Verify your identity" → pick the verification-code method
//! 4. one-time code → Verify
//! 5. optional "existing session" and "Stay signed in?" prompts
//! 6. poll for the session cookie
//!
//! If any step times out the flow falls back to waiting for the user to
//! finish the login by hand in the (visible) browser window.

pub mod chrome;

use crate::stop::{StopFlag, Stopped};
use crate::totp::Totp;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use chrome::{BrowserSettings, ChromePage};

pub mod selectors {
    pub const IDENTITY_FIELD: &str = r#"input[name="loginfmt"]"#;
    pub const NEXT_BUTTON: &str = "#idSIButton9";
    pub const PASSWORD_FIELD: &str = r#"input[name="passwd"]"#;
    pub const BACK_BUTTON: &str = "#idBtn_Back";
    pub const CODE_FIELD: &str =
        "#idTxtBx_SAOTCC_OTC, input[name='otc'], input[type='tel'], input[type='number']";
    pub const CODE_SUBMIT: &str = "#idSubmit_SAOTCC_Continue";
    pub const STAY_SIGNED_IN: &str = "#idSIButton9";
    pub const SESSION_CONTINUE: &str = "input[name='btnContinue']";
}

/// Link labels for the verification-code method, tried in order
pub const MFA_LABELS: &[&str] = &[
    "Use a verification code",
    "Use verification code",
    "verification code",
];

/// Elements mentioning this are push-approval options, never the code method
const MFA_LABEL_EXCLUDE: &str = "Approve";

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Browser error: {0}")]
    Browser(String),
    #[error("Page script returned an unexpected value: {0}")]
    Script(String),
}

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Login step timed out: {0}")]
    StepTimeout(Step),
    #[error("Session cookie was not issued")]
    CookieNotObtained,
    #[error("Login stopped by user")]
    Stopped,
    #[error("Page error: {0}")]
    Page(#[from] PageError),
}

impl From<Stopped> for LoginError {
    fn from(_: Stopped) -> Self {
        LoginError::Stopped
    }
}

/// Gateway session identifier, valid for one tunnel launch
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix safe to show in logs
    pub fn preview(&self) -> String {
        let prefix: String = self.0.chars().take(8).collect();
        format!("{}...", prefix)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.preview())
    }
}

/// What the login flow needs from a browser
///
/// All checks are non-blocking; the flow does its own polling so that a
/// stop request is noticed between checks.
pub trait LoginPage {
    fn open(&mut self, url: &str) -> Result<(), PageError>;
    /// Whether an element matching `selector` is currently rendered
    fn is_visible(&mut self, selector: &str) -> Result<bool, PageError>;
    fn fill(&mut self, selector: &str, text: &str) -> Result<(), PageError>;
    fn click(&mut self, selector: &str) -> Result<(), PageError>;
    /// Click the first clickable element whose own text contains `text`
    /// and does not mention `exclude`. Returns `false` if nothing matched.
    fn click_text(&mut self, text: &str, exclude: &str) -> Result<bool, PageError>;
    /// Value of cookie `name` for the gateway, if issued
    fn cookie(&mut self, name: &str) -> Result<Option<String>, PageError>;
}

/// Login page states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AwaitIdentityField,
    IdentityEntered,
    AwaitPasswordField,
    PasswordEntered,
    AwaitMfaChooser,
    MfaMethodSelected,
    AwaitCodeField,
    CodeSubmitted,
    AwaitSessionConfirmation,
    AwaitStaySignedInPrompt,
    AwaitSessionCookie,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::AwaitIdentityField => "identity field",
            Step::IdentityEntered => "identity submit",
            Step::AwaitPasswordField => "password field",
            Step::PasswordEntered => "password submit",
            Step::AwaitMfaChooser => "MFA method chooser",
            Step::MfaMethodSelected => "MFA method selection",
            Step::AwaitCodeField => "verification code field",
            Step::CodeSubmitted => "verification code submit",
            Step::AwaitSessionConfirmation => "existing session prompt",
            Step::AwaitStaySignedInPrompt => "stay signed in prompt",
            Step::AwaitSessionCookie => "session cookie",
        };
        f.write_str(name)
    }
}

/// Result of one state's transition function
#[derive(Debug)]
pub enum Transition {
    Advance(Step),
    /// Go back to the MFA chooser and try the next label
    Retry(String),
    Fail(LoginError),
    Done(SessionToken),
}

/// Wait budgets for each phase of the flow
#[derive(Debug, Clone)]
pub struct LoginTimings {
    pub identity: Duration,
    pub step: Duration,
    pub mfa_chooser: Duration,
    pub code_field: Duration,
    pub optional_prompt: Duration,
    pub cookie: Duration,
    pub manual: Duration,
    pub element_poll: Duration,
    pub cookie_poll: Duration,
    /// Pause after a click so the next page can start rendering
    pub settle: Duration,
    pub mfa_attempts: u32,
}

impl Default for LoginTimings {
    fn default() -> Self {
        Self {
            identity: Duration::from_secs(30),
            step: Duration::from_secs(15),
            mfa_chooser: Duration::from_secs(10),
            code_field: Duration::from_secs(10),
            optional_prompt: Duration::from_secs(10),
            cookie: Duration::from_secs(120),
            manual: Duration::from_secs(300),
            element_poll: Duration::from_millis(250),
            cookie_poll: Duration::from_secs(1),
            settle: Duration::from_millis(300),
            mfa_attempts: 3,
        }
    }
}

/// Gateway endpoint and the cookie it issues
#[derive(Debug, Clone)]
pub struct LoginTarget {
    pub url: String,
    pub cookie_name: String,
}

/// Identity, password and code generator for one login
#[derive(Clone)]
pub struct LoginCredentials {
    pub identity: String,
    pub password: String,
    pub totp: Totp,
}

/// One pass through the sign-in pages
pub struct LoginFlow<'a, P: LoginPage> {
    page: &'a mut P,
    target: &'a LoginTarget,
    credentials: &'a LoginCredentials,
    timings: &'a LoginTimings,
    stop: &'a StopFlag,
    mfa_attempt: u32,
}

impl<'a, P: LoginPage> LoginFlow<'a, P> {
    pub fn new(
        page: &'a mut P,
        target: &'a LoginTarget,
        credentials: &'a LoginCredentials,
        timings: &'a LoginTimings,
        stop: &'a StopFlag,
    ) -> Self {
        Self {
            page,
            target,
            credentials,
            timings,
            stop,
            mfa_attempt: 0,
        }
    }

    /// Open the login page and run the state machine to completion
    pub fn run(&mut self) -> Result<SessionToken, LoginError> {
        info!("Opening login page {}", self.target.url);
        self.page.open(&self.target.url)?;

        let mut step = Step::AwaitIdentityField;
        loop {
            self.stop.check()?;
            debug!("Login step: {}", step);

            match self.transition(step) {
                Transition::Advance(next) => step = next,
                Transition::Retry(reason) => {
                    self.mfa_attempt += 1;
                    if self.mfa_attempt >= self.timings.mfa_attempts {
                        warn!("Giving up on MFA method selection: {}", reason);
                        return Err(LoginError::StepTimeout(step));
                    }
                    info!(
                        "Retrying MFA method selection ({}/{}): {}",
                        self.mfa_attempt + 1,
                        self.timings.mfa_attempts,
                        reason
                    );
                    step = Step::AwaitMfaChooser;
                }
                Transition::Fail(e) => return Err(e),
                Transition::Done(token) => return Ok(token),
            }
        }
    }

    fn transition(&mut self, step: Step) -> Transition {
        let result = match step {
            Step::AwaitIdentityField => self.await_identity_field(),
            Step::IdentityEntered => self.submit(Step::AwaitPasswordField),
            Step::AwaitPasswordField => self.await_password_field(),
            Step::PasswordEntered => self.submit(Step::AwaitMfaChooser),
            Step::AwaitMfaChooser => self.await_mfa_chooser(),
            Step::MfaMethodSelected => self.mfa_method_selected(),
            Step::AwaitCodeField => self.await_code_field(),
            Step::CodeSubmitted => self.code_submitted(),
            Step::AwaitSessionConfirmation => self.await_session_confirmation(),
            Step::AwaitStaySignedInPrompt => self.await_stay_signed_in(),
            Step::AwaitSessionCookie => self.await_session_cookie(),
        };

        result.unwrap_or_else(Transition::Fail)
    }

    fn await_identity_field(&mut self) -> Result<Transition, LoginError> {
        info!("Step 1/5: entering identity");
        if !self.wait_for(selectors::IDENTITY_FIELD, self.timings.identity)? {
            return Ok(Transition::Fail(LoginError::StepTimeout(
                Step::AwaitIdentityField,
            )));
        }
        self.page
            .fill(selectors::IDENTITY_FIELD, &self.credentials.identity)?;
        Ok(Transition::Advance(Step::IdentityEntered))
    }

    fn submit(&mut self, next: Step) -> Result<Transition, LoginError> {
        self.settle()?;
        self.page.click(selectors::NEXT_BUTTON)?;
        self.settle()?;
        Ok(Transition::Advance(next))
    }

    fn await_password_field(&mut self) -> Result<Transition, LoginError> {
        info!("Step 2/5: entering password");
        if !self.wait_for(selectors::PASSWORD_FIELD, self.timings.step)? {
            return Ok(Transition::Fail(LoginError::StepTimeout(
                Step::AwaitPasswordField,
            )));
        }
        self.page
            .fill(selectors::PASSWORD_FIELD, &self.credentials.password)?;
        Ok(Transition::Advance(Step::PasswordEntered))
    }

    fn await_mfa_chooser(&mut self) -> Result<Transition, LoginError> {
        let label = MFA_LABELS[self.mfa_attempt as usize % MFA_LABELS.len()];
        info!("Step 3/5: looking for '{}'", label);

        let deadline = Instant::now() + self.timings.mfa_chooser;
        loop {
            // Accounts whose default method is the code skip the chooser
            if self.page.is_visible(selectors::CODE_FIELD)? {
                debug!("Code field already shown, skipping method chooser");
                return Ok(Transition::Advance(Step::AwaitCodeField));
            }
            if self.page.click_text(label, MFA_LABEL_EXCLUDE)? {
                return Ok(Transition::Advance(Step::MfaMethodSelected));
            }
            if Instant::now() >= deadline {
                break;
            }
            self.stop.sleep_blocking(self.timings.element_poll)?;
        }

        // Security-key and push pages offer a way back to the method list
        if self.page.is_visible(selectors::BACK_BUTTON)? {
            debug!("Clicking back to leave the current verification page");
            self.page.click(selectors::BACK_BUTTON)?;
            self.settle()?;
        }
        Ok(Transition::Retry(format!("'{}' not offered", label)))
    }

    fn mfa_method_selected(&mut self) -> Result<Transition, LoginError> {
        if self.wait_for(selectors::CODE_FIELD, self.timings.code_field)? {
            return Ok(Transition::Advance(Step::AwaitCodeField));
        }
        if self.page.is_visible(selectors::BACK_BUTTON)? {
            self.page.click(selectors::BACK_BUTTON)?;
            self.settle()?;
        }
        Ok(Transition::Retry(
            "code field did not appear after choosing the method".to_string(),
        ))
    }

    fn await_code_field(&mut self) -> Result<Transition, LoginError> {
        info!("Step 4/5: entering verification code");
        if !self.wait_for(selectors::CODE_FIELD, self.timings.code_field)? {
            return Ok(Transition::Fail(LoginError::StepTimeout(Step::AwaitCodeField)));
        }
        // Generated as late as possible so it is not stale on submit
        let code = self
            .credentials
            .totp
            .code_now()
            .map_err(|e| PageError::Script(e.to_string()))?;
        self.page.fill(selectors::CODE_FIELD, &code)?;
        Ok(Transition::Advance(Step::CodeSubmitted))
    }

    fn code_submitted(&mut self) -> Result<Transition, LoginError> {
        self.settle()?;
        self.page.click(selectors::CODE_SUBMIT)?;
        self.settle()?;
        Ok(Transition::Advance(Step::AwaitSessionConfirmation))
    }

    fn await_session_confirmation(&mut self) -> Result<Transition, LoginError> {
        if self.page.is_visible(selectors::SESSION_CONTINUE)? {
            info!("Existing session found, continuing");
            self.page.click(selectors::SESSION_CONTINUE)?;
            self.settle()?;
        }
        Ok(Transition::Advance(Step::AwaitStaySignedInPrompt))
    }

    fn await_stay_signed_in(&mut self) -> Result<Transition, LoginError> {
        info!("Step 5/5: stay signed in");
        if self.wait_for(selectors::STAY_SIGNED_IN, self.timings.optional_prompt)? {
            self.page.click(selectors::STAY_SIGNED_IN)?;
            debug!("Clicked 'Yes' on stay signed in");
        } else {
            debug!("No stay signed in prompt");
        }
        Ok(Transition::Advance(Step::AwaitSessionCookie))
    }

    fn await_session_cookie(&mut self) -> Result<Transition, LoginError> {
        info!("Waiting for VPN session cookie...");
        match wait_for_cookie(
            &mut *self.page,
            &self.target.cookie_name,
            self.timings.cookie,
            self.timings.cookie_poll,
            self.stop,
        )? {
            Some(token) => Ok(Transition::Done(token)),
            None => Ok(Transition::Fail(LoginError::CookieNotObtained)),
        }
    }

    /// Poll until `selector` is visible; `Ok(false)` on timeout
    fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool, LoginError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.page.is_visible(selector)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            self.stop.sleep_blocking(self.timings.element_poll)?;
        }
    }

    fn settle(&self) -> Result<(), Stopped> {
        self.stop.sleep_blocking(self.timings.settle)
    }
}

/// Poll for the session cookie, dismissing the "existing session" page
/// whenever it shows up in between.
fn wait_for_cookie<P: LoginPage>(
    page: &mut P,
    cookie_name: &str,
    timeout: Duration,
    poll: Duration,
    stop: &StopFlag,
) -> Result<Option<SessionToken>, LoginError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = page.cookie(cookie_name)? {
            return Ok(Some(SessionToken::new(value)));
        }
        if page.is_visible(selectors::SESSION_CONTINUE)? {
            info!("Existing session found, continuing");
            page.click(selectors::SESSION_CONTINUE)?;
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        stop.sleep_blocking(poll)?;
    }
}

/// Run the automated flow, falling back to a manual-completion wait
///
/// A step timeout or page error leaves the browser where it is and gives
/// the user the longer manual budget to finish the login by hand.
pub fn obtain_session_token<P: LoginPage>(
    page: &mut P,
    target: &LoginTarget,
    credentials: &LoginCredentials,
    timings: &LoginTimings,
    stop: &StopFlag,
) -> Result<SessionToken, LoginError> {
    let automated = LoginFlow::new(&mut *page, target, credentials, timings, stop).run();

    let token = match automated {
        Ok(token) => token,
        Err(e @ (LoginError::StepTimeout(_) | LoginError::Page(_))) => {
            warn!("Automated login error: {}", e);
            println!("Falling back to manual login. Complete the sign-in in the browser.");
            wait_for_cookie(page, &target.cookie_name, timings.manual, timings.cookie_poll, stop)?
                .ok_or(LoginError::CookieNotObtained)?
        }
        Err(e) => return Err(e),
    };

    info!("Got session cookie: {}", token.preview());
    Ok(token)
}
