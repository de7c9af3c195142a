//! Generation mode selection.
//!
//! `resolve_mode` is a pure function of the request-scoped candidate set,
//! the configured page ceiling, and provider availability. It runs on
//! every request; nothing about a previous decision carries over.

use std::fmt;

/// Requested/effective generation strategy. `Auto` is resolved before
/// generation and never reaches a driver or the response metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Chunks,
    Gemini,
    Auto,
}

impl GenerationMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value
            .map(|v| v.trim().to_lowercase())
            .unwrap_or_else(|| "auto".to_string())
            .as_str()
        {
            "chunks" => GenerationMode::Chunks,
            "gemini" => GenerationMode::Gemini,
            _ => GenerationMode::Auto,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GenerationMode::Chunks => "chunks",
            GenerationMode::Gemini => "gemini",
            GenerationMode::Auto => "auto",
        }
    }
}

/// Why a request was (or had to be) downgraded to chunk mode.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    NoCandidateFiles,
    ProviderUnavailable,
    PageCeilingExceeded { total_pages: i64, ceiling: i64 },
    FileFetch(String),
    FileUpload(String),
    CacheCreate(String),
    Generation(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoCandidateFiles => write!(f, "no document candidates"),
            FallbackReason::ProviderUnavailable => {
                write!(f, "document provider unavailable")
            }
            FallbackReason::PageCeilingExceeded {
                total_pages,
                ceiling,
            } => write!(f, "page ceiling exceeded: {} > {}", total_pages, ceiling),
            FallbackReason::FileFetch(msg) => write!(f, "document fetch failed: {}", msg),
            FallbackReason::FileUpload(msg) => write!(f, "file upload failed: {}", msg),
            FallbackReason::CacheCreate(msg) => write!(f, "cache creation failed: {}", msg),
            FallbackReason::Generation(msg) => write!(f, "document generation failed: {}", msg),
        }
    }
}

/// Outcome of mode selection: the mode to run and, when the requested
/// strategy could not stand, the recorded reason.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeDecision {
    pub mode: GenerationMode,
    pub fallback: Option<FallbackReason>,
}

impl ModeDecision {
    pub fn chunks(reason: Option<FallbackReason>) -> Self {
        ModeDecision {
            mode: GenerationMode::Chunks,
            fallback: reason,
        }
    }

    pub fn gemini() -> Self {
        ModeDecision {
            mode: GenerationMode::Gemini,
            fallback: None,
        }
    }
}

pub fn resolve_mode(
    requested: GenerationMode,
    candidate_file_count: usize,
    total_pages: i64,
    page_ceiling: i64,
    provider_available: bool,
) -> ModeDecision {
    if requested == GenerationMode::Chunks {
        return ModeDecision::chunks(None);
    }

    if candidate_file_count == 0 {
        return ModeDecision::chunks(Some(FallbackReason::NoCandidateFiles));
    }

    if !provider_available {
        return ModeDecision::chunks(Some(FallbackReason::ProviderUnavailable));
    }

    if total_pages > page_ceiling {
        return ModeDecision::chunks(Some(FallbackReason::PageCeilingExceeded {
            total_pages,
            ceiling: page_ceiling,
        }));
    }

    ModeDecision::gemini()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_candidates_always_resolve_to_chunks() {
        for requested in [GenerationMode::Auto, GenerationMode::Gemini] {
            let decision = resolve_mode(requested, 0, 0, 500, true);
            assert_eq!(decision.mode, GenerationMode::Chunks);
            assert_eq!(decision.fallback, Some(FallbackReason::NoCandidateFiles));
        }
    }

    #[test]
    fn explicit_chunks_request_stands_without_reason() {
        let decision = resolve_mode(GenerationMode::Chunks, 3, 50, 500, true);
        assert_eq!(decision.mode, GenerationMode::Chunks);
        assert!(decision.fallback.is_none());
    }

    #[test]
    fn missing_credential_downgrades() {
        let decision = resolve_mode(GenerationMode::Auto, 3, 50, 500, false);
        assert_eq!(decision.mode, GenerationMode::Chunks);
        assert_eq!(decision.fallback, Some(FallbackReason::ProviderUnavailable));
    }

    #[test]
    fn page_ceiling_downgrades_with_counts_in_reason() {
        let decision = resolve_mode(GenerationMode::Auto, 3, 50, 10, true);
        assert_eq!(decision.mode, GenerationMode::Chunks);
        let reason = decision.fallback.unwrap();
        assert_eq!(
            reason,
            FallbackReason::PageCeilingExceeded {
                total_pages: 50,
                ceiling: 10
            }
        );
        assert!(reason.to_string().contains("50 > 10"));
    }

    #[test]
    fn within_ceiling_resolves_to_gemini() {
        let decision = resolve_mode(GenerationMode::Auto, 3, 50, 500, true);
        assert_eq!(decision, ModeDecision::gemini());

        let decision = resolve_mode(GenerationMode::Gemini, 3, 500, 500, true);
        assert_eq!(decision, ModeDecision::gemini());
    }
}
