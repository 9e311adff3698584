use crate::phase::CognitivePhase;

/// The trust-ladder tiers, strongest first. Snippets are labeled with the
/// tier they came from so the model can weigh them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustTier {
    Session,
    HotTemporal,
    Document,
    Episodic,
    ProcessVector,
    Keyword,
}

impl TrustTier {
    pub fn label(self) -> &'static str {
        match self {
            TrustTier::Session => "session",
            TrustTier::HotTemporal => "hot-temporal",
            TrustTier::Document => "document",
            TrustTier::Episodic => "episodic",
            TrustTier::ProcessVector => "process-vector",
            TrustTier::Keyword => "keyword",
        }
    }
}

/// One retrieved snippet ready for prompt assembly.
#[derive(Debug, Clone)]
pub struct ContextSnippet {
    pub tier: TrustTier,
    pub text: String,
}

/// Everything the system prompt is assembled from.
pub struct PromptInputs<'a> {
    pub persona: &'a str,
    pub instructions: &'a str,
    pub phase: CognitivePhase,
    pub snippets: &'a [ContextSnippet],
    /// Enterprise twins put documents ahead of conversational memory.
    pub document_first: bool,
}

/// The tool protocol taught to the model: the four markers and their
/// argument grammar. Kept verbatim in every system prompt.
pub const TOOL_PROTOCOL: &str = r#"You can reach into memory mid-reply by emitting one of these markers,
which are executed and folded into your answer before the user sees it:

  [GREP term="X"]                         keyword recall over past exchanges
  [SQUIRREL timeframe="-60min" back=N search="X"]   most-recent exchanges in a window
  [VECTOR query="X"]                      semantic recall over prior reasoning
  [EPISODIC query="X" timeframe="7d"]     semantic + time-window recall

Rules: arguments are key="value" pairs separated by spaces; values must not
contain unescaped double quotes; emit each marker kind at most once. Only
emit a marker when your memory of this user genuinely might hold the answer."#;

/// Assemble the system prompt: persona, tenant instructions, trust ladder,
/// tiered context, then the tool protocol.
pub fn assemble_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str(inputs.persona.trim());
    prompt.push_str("\n\n");

    if !inputs.instructions.trim().is_empty() {
        prompt.push_str("Tenant instructions:\n");
        prompt.push_str(inputs.instructions.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!(
        "Conversation phase: {}.\n\n",
        inputs.phase
    ));

    let order: &[TrustTier] = if inputs.document_first {
        &[
            TrustTier::Session,
            TrustTier::Document,
            TrustTier::HotTemporal,
            TrustTier::Episodic,
            TrustTier::ProcessVector,
            TrustTier::Keyword,
        ]
    } else {
        &[
            TrustTier::Session,
            TrustTier::HotTemporal,
            TrustTier::Document,
            TrustTier::Episodic,
            TrustTier::ProcessVector,
            TrustTier::Keyword,
        ]
    };

    let has_context = !inputs.snippets.is_empty();
    if has_context {
        prompt.push_str(
            "Retrieved context, strongest tier first. Trust higher tiers over \
             lower ones when they disagree:\n",
        );
        for tier in order {
            for snippet in inputs.snippets.iter().filter(|s| s.tier == *tier) {
                prompt.push_str(&format!("[{}] {}\n", tier.label(), snippet.text.trim()));
            }
        }
        prompt.push('\n');
    } else {
        prompt.push_str("No stored context matched this message.\n\n");
    }

    prompt.push_str(TOOL_PROTOCOL);
    prompt
}
