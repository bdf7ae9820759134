// Decrypted credential, only ever held in a local scope

/// A decrypted credential. `Debug` never prints secret material.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub identity: String,
    /// Stored in plaintext.
    pub label: String,
    pub account: String,
    pub secret: String,
    /// Optional binary blob, typically a private key.
    pub attachment: Option<Vec<u8>>,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("identity", &self.identity)
            .field("label", &self.label)
            .field("account", &self.account)
            .field("secret", &"<redacted>")
            .field(
                "attachment",
                &self.attachment.as_ref().map(|a| format!("<{} bytes>", a.len())),
            )
            .finish()
    }
}
