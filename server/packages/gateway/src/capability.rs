use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Something the agent sandbox can do beyond plain text generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ImageGeneration,
    VideoGeneration,
    AudioGeneration,
    DeepResearch,
    WebSearch,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::ImageGeneration,
        Capability::VideoGeneration,
        Capability::AudioGeneration,
        Capability::DeepResearch,
        Capability::WebSearch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImageGeneration => "image_generation",
            Self::VideoGeneration => "video_generation",
            Self::AudioGeneration => "audio_generation",
            Self::DeepResearch => "deep_research",
            Self::WebSearch => "web_search",
        }
    }

    /// Boolean variable the agent reads to learn whether this is available.
    pub fn env_key(self) -> &'static str {
        match self {
            Self::ImageGeneration => "JANUS_ENABLE_IMAGE_GENERATION",
            Self::VideoGeneration => "JANUS_ENABLE_VIDEO_GENERATION",
            Self::AudioGeneration => "JANUS_ENABLE_AUDIO_GENERATION",
            Self::DeepResearch => "JANUS_ENABLE_DEEP_RESEARCH",
            Self::WebSearch => "JANUS_ENABLE_WEB_SEARCH",
        }
    }

    pub fn doc_file(self) -> &'static str {
        match self {
            Self::ImageGeneration => "image_generation.md",
            Self::VideoGeneration => "video_generation.md",
            Self::AudioGeneration => "audio_generation.md",
            Self::DeepResearch => "deep_research.md",
            Self::WebSearch => "web_search.md",
        }
    }

    /// Imperative used in the mandatory-capabilities prompt block.
    pub fn instruction(self, artifact_dir: &str) -> String {
        match self {
            Self::ImageGeneration => {
                format!("You must produce at least one image file in {artifact_dir}.")
            }
            Self::VideoGeneration => {
                format!("You must produce at least one video file in {artifact_dir}.")
            }
            Self::AudioGeneration => {
                format!("You must produce at least one audio file in {artifact_dir}.")
            }
            Self::DeepResearch => "You must research the question in depth across multiple \
                 sources and cite them."
                .to_string(),
            Self::WebSearch => {
                "You must search the web and base the answer on current results.".to_string()
            }
        }
    }
}

/// Explicit generation intent sent by the client alongside the messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct GenerationFlags {
    #[serde(default)]
    pub generate_image: bool,
    #[serde(default)]
    pub generate_video: bool,
    #[serde(default)]
    pub generate_audio: bool,
    #[serde(default)]
    pub deep_research: bool,
    #[serde(default)]
    pub web_search: bool,
}

impl GenerationFlags {
    pub fn any(&self) -> bool {
        !self.required().is_empty()
    }

    /// Capabilities the user made mandatory for this turn.
    pub fn required(&self) -> Vec<Capability> {
        let mut required = Vec::new();
        if self.generate_image {
            required.push(Capability::ImageGeneration);
        }
        if self.generate_video {
            required.push(Capability::VideoGeneration);
        }
        if self.generate_audio {
            required.push(Capability::AudioGeneration);
        }
        if self.deep_research {
            required.push(Capability::DeepResearch);
        }
        if self.web_search {
            required.push(Capability::WebSearch);
        }
        required
    }
}
