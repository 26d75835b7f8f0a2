//! Static bidirectional model mapping across vendors and tiers.

use crate::types::{Capability, Tier, Vendor};

/// One equivalence class of models. The OpenAI name is the canonical
/// identifier; the other vendors may have no equivalent.
#[derive(Debug, Clone)]
pub struct ModelMapping {
    pub tier: Tier,
    pub capability: Capability,
    pub openai: &'static str,
    pub anthropic: Option<&'static str>,
    pub google: Option<&'static str>,
}

impl ModelMapping {
    /// The vendor-side name for this class, if the vendor can serve it.
    pub fn name_for(&self, vendor: Vendor) -> Option<&'static str> {
        match vendor {
            Vendor::OpenAi => Some(self.openai),
            Vendor::Anthropic => self.anthropic,
            Vendor::Google => self.google,
        }
    }

    fn lists(&self, name: &str) -> bool {
        self.openai == name || self.anthropic == Some(name) || self.google == Some(name)
    }
}

/// Read-only lookup over the mapping table. Constructed once at startup.
#[derive(Debug, Clone)]
pub struct Catalog {
    mappings: Vec<ModelMapping>,
}

const fn map(
    tier: Tier,
    capability: Capability,
    openai: &'static str,
    anthropic: Option<&'static str>,
    google: Option<&'static str>,
) -> ModelMapping {
    ModelMapping {
        tier,
        capability,
        openai,
        anthropic,
        google,
    }
}

/// Declaration order matters: `find_mapping` returns the first hit, so
/// specific family entries must precede generic aliases.
fn default_mappings() -> Vec<ModelMapping> {
    const CHAT: Capability = Capability::Chat;
    vec![
        // Chat
        map(Tier::Premium, CHAT, "gpt-4o", Some("claude-opus-4-6"), Some("gemini-2.5-pro")),
        map(Tier::Premium, CHAT, "gpt-4-turbo", Some("claude-opus-4-5"), Some("gemini-2.5-pro")),
        map(Tier::Standard, CHAT, "gpt-4o-mini", Some("claude-sonnet-4-5"), Some("gemini-2.5-flash")),
        map(Tier::Standard, CHAT, "gpt-4.1", Some("claude-sonnet-4-5-20250929"), Some("gemini-2.5-flash")),
        map(Tier::Economy, CHAT, "gpt-3.5-turbo", Some("claude-haiku-4-5"), Some("gemini-2.5-flash-lite")),
        // Images (Anthropic has no image generation)
        map(Tier::Images, Capability::Images, "dall-e-3", None, Some("imagen-3.0-generate-001")),
        map(Tier::Images, Capability::Images, "gpt-image-1", None, Some("imagen-3.0-generate-001")),
        // Embeddings (OpenAI only)
        map(Tier::Embeddings, Capability::Embeddings, "text-embedding-3-small", None, None),
        map(Tier::Embeddings, Capability::Embeddings, "text-embedding-3-large", None, None),
        map(Tier::Embeddings, Capability::Embeddings, "text-embedding-ada-002", None, None),
    ]
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            mappings: default_mappings(),
        }
    }

    /// Build a catalog from an explicit table (tests, alternate deployments).
    pub fn with_mappings(mappings: Vec<ModelMapping>) -> Self {
        Self { mappings }
    }

    /// First mapping that lists `name` under any vendor, in declaration order.
    pub fn find_mapping(&self, name: &str) -> Option<&ModelMapping> {
        self.mappings.iter().find(|m| m.lists(name))
    }

    /// The requested vendor's equivalent for the class of `name`. `None`
    /// means this vendor cannot serve it.
    pub fn model_for_vendor(&self, name: &str, vendor: Vendor) -> Option<&'static str> {
        self.find_mapping(name).and_then(|m| m.name_for(vendor))
    }

    /// Capability of the class of `name`. Unknown names default to chat so
    /// they still route with best effort.
    pub fn capability_for_model(&self, name: &str) -> Capability {
        self.find_mapping(name)
            .map(|m| m.capability)
            .unwrap_or(Capability::Chat)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_mapping_matches_any_vendor_column() {
        let catalog = Catalog::new();
        let by_openai = catalog.find_mapping("gpt-4o").unwrap();
        let by_anthropic = catalog.find_mapping("claude-opus-4-6").unwrap();
        assert_eq!(by_openai.openai, by_anthropic.openai);
        assert_eq!(by_openai.tier, Tier::Premium);
    }

    #[test]
    fn declaration_order_wins_on_shared_names() {
        // gemini-2.5-pro appears in two premium rows; the first declared wins.
        let catalog = Catalog::new();
        let m = catalog.find_mapping("gemini-2.5-pro").unwrap();
        assert_eq!(m.openai, "gpt-4o");
    }

    #[test]
    fn model_for_vendor_translates_across_the_class() {
        let catalog = Catalog::new();
        assert_eq!(
            catalog.model_for_vendor("gpt-4o", Vendor::Anthropic),
            Some("claude-opus-4-6")
        );
        assert_eq!(
            catalog.model_for_vendor("claude-haiku-4-5", Vendor::OpenAi),
            Some("gpt-3.5-turbo")
        );
        // Anthropic has no image models.
        assert_eq!(catalog.model_for_vendor("dall-e-3", Vendor::Anthropic), None);
    }

    #[test]
    fn unknown_model_defaults_to_chat() {
        let catalog = Catalog::new();
        assert_eq!(catalog.capability_for_model("gpt-42"), Capability::Chat);
        assert_eq!(
            catalog.capability_for_model("dall-e-3"),
            Capability::Images
        );
    }
}
