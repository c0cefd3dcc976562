//! Log-safe rendering of credentials and prompts

/// Helpers for rendering sensitive values in logs and error messages
pub struct Sanitizer;

impl Sanitizer {
    /// Masks a credential, keeping only its last four characters
    ///
    /// ```
    /// use scrollwork_lib::security::Sanitizer;
    ///
    /// assert_eq!(Sanitizer::mask_secret("sk-ant-admin01-abcdefgh"), "***efgh");
    /// assert_eq!(Sanitizer::mask_secret("abcd"), "****");
    /// ```
    pub fn mask_secret(secret: &str) -> String {
        let chars: Vec<char> = secret.chars().collect();
        if chars.len() > 4 {
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("***{}", tail)
        } else {
            "****".to_string()
        }
    }

    /// Shortens free text (e.g. a provider error body) for a log line
    pub fn truncate(text: &str, max_chars: usize) -> String {
        let mut chars = text.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }
}
