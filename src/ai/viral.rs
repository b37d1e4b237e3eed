//! Viral content generation: a strategy call followed by a content call, each
//! with its own fallback, plus capped-concurrency campaign generation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::adapter::{
    record_fallback, request_typed, DynLlmClient, LlmError, LlmRequest, LlmTask,
};
use crate::history::BoundedHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Post,
    Story,
    Video,
    Thread,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Post => "post",
            ContentType::Story => "story",
            ContentType::Video => "video",
            ContentType::Thread => "thread",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Instagram,
    Tiktok,
    Linkedin,
    Facebook,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Linkedin => "linkedin",
            Platform::Facebook => "facebook",
        }
    }

    /// Formatting guidance passed to the model. Not enforced on the output.
    fn guidance(self) -> &'static str {
        match self {
            Platform::Twitter => {
                "Max 280 characters, punchy, 1-3 hashtags, strong hook in the first line."
            }
            Platform::Instagram => {
                "Up to 2200 characters, visual storytelling, line breaks, 5-15 hashtags."
            }
            Platform::Tiktok => {
                "Short caption under 150 characters for a video, trend-aware, 3-5 hashtags."
            }
            Platform::Linkedin => {
                "Professional tone, 1300 characters max, insight-led, 3 hashtags."
            }
            Platform::Facebook => {
                "Conversational, community-oriented, under 500 characters, 1-2 hashtags."
            }
        }
    }

    /// Fixed score used when the content call fails.
    fn fallback_score(self) -> u8 {
        match self {
            Platform::Twitter => 70,
            Platform::Instagram => 65,
            Platform::Tiktok => 75,
            Platform::Linkedin => 55,
            Platform::Facebook => 50,
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = ViralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "twitter" | "x" => Ok(Platform::Twitter),
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::Tiktok),
            "linkedin" => Ok(Platform::Linkedin),
            "facebook" => Ok(Platform::Facebook),
            other => Err(ViralError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Placeholder counters; nothing feeds real metrics back into them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub likes: u64,
    pub shares: u64,
    pub comments: u64,
    pub views: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViralContent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub platform: Platform,
    pub topic: String,
    pub content: String,
    pub hashtags: Vec<String>,
    pub viral_score: u8,
    pub engagement: Engagement,
    pub ai_used: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ViralStrategy {
    pub trending_topics: Vec<String>,
    pub hooks: Vec<String>,
    pub hashtag_ideas: Vec<String>,
    pub best_posting_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentReply {
    content: String,
    #[serde(default)]
    hashtags: Vec<String>,
    #[serde(default)]
    viral_score: Option<f64>,
}

/// Aggregated record of a generated item, used to rank hashtags per platform.
#[derive(Debug, Clone, PartialEq)]
pub struct ViralPattern {
    pub platform: Platform,
    pub content_type: ContentType,
    pub hashtags: Vec<String>,
    pub viral_score: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViralError {
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("at least one platform is required")]
    NoPlatforms,
    #[error("campaign duration must be 1..={max} days, got {got}")]
    InvalidDuration { got: u32, max: u32 },
    #[error("unknown platform '{0}'")]
    UnknownPlatform(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRequest {
    pub topic: String,
    pub platforms: Vec<Platform>,
    pub duration_days: u32,
}

/// Round and clamp to 0..=100; NaN becomes 0.
pub fn clamp_viral_score(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

/// Trim, `#`-prefix, drop empties and case-insensitive duplicates.
pub fn normalize_hashtags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for t in tags {
        let body: String = t
            .as_ref()
            .trim()
            .trim_start_matches('#')
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if body.is_empty() {
            continue;
        }
        if seen.insert(body.to_lowercase()) {
            out.push(format!("#{body}"));
        }
    }
    out
}

fn topic_hashtag(topic: &str) -> String {
    let camel: String = topic
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut cs = w.chars();
            match cs.next() {
                Some(f) => f.to_uppercase().chain(cs).collect::<String>(),
                None => String::new(),
            }
        })
        .collect();
    if camel.is_empty() {
        "#Trending".to_string()
    } else {
        format!("#{camel}")
    }
}

pub fn fallback_strategy(topic: &str) -> ViralStrategy {
    ViralStrategy {
        trending_topics: vec![topic.to_string(), "behind the scenes".into()],
        hooks: vec![
            format!("Here is what nobody tells you about {topic}"),
            "3 lessons we learned the hard way".into(),
        ],
        hashtag_ideas: vec![topic_hashtag(topic), "#Innovation".into(), "#Community".into()],
        best_posting_time: Some("18:00-21:00 local".into()),
    }
}

const CAMPAIGN_TYPES: [ContentType; 3] =
    [ContentType::Post, ContentType::Story, ContentType::Video];

pub struct ViralContentGenerator {
    llm: DynLlmClient,
    patterns: Arc<BoundedHistory<ViralPattern>>,
    max_concurrency: usize,
    max_campaign_days: u32,
}

impl ViralContentGenerator {
    pub fn new(
        llm: DynLlmClient,
        patterns: Arc<BoundedHistory<ViralPattern>>,
        max_concurrency: usize,
        max_campaign_days: u32,
    ) -> Self {
        Self {
            llm,
            patterns,
            max_concurrency: max_concurrency.max(1),
            max_campaign_days: max_campaign_days.max(1),
        }
    }

    pub async fn analyze_strategy(&self, topic: &str, platform: Platform) -> ViralStrategy {
        let req = LlmRequest::new(
            LlmTask::ViralStrategy,
            VIRAL_SYSTEM_PROMPT,
            format!(
                r##"Build a viral strategy for the topic "{topic}" on {platform}.

Return JSON:
{{
  "trendingTopics": ["..."],
  "hooks": ["..."],
  "hashtagIdeas": ["#..."],
  "bestPostingTime": "..."
}}"##,
                platform = platform.as_str()
            ),
        )
        .max_tokens(400);

        match request_typed::<ViralStrategy>(self.llm.as_ref(), &req).await {
            Ok(s) => s,
            Err(e) => {
                record_fallback(LlmTask::ViralStrategy, &e);
                fallback_strategy(topic)
            }
        }
    }

    pub async fn generate_viral_content(
        &self,
        topic: &str,
        platform: Platform,
        content_type: ContentType,
    ) -> Result<ViralContent, ViralError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ViralError::EmptyTopic);
        }

        let strategy = self.analyze_strategy(topic, platform).await;
        let req = LlmRequest::new(
            LlmTask::ViralContent,
            VIRAL_SYSTEM_PROMPT,
            content_prompt(topic, platform, content_type, &strategy),
        );

        let (content, hashtags, score, ai_used) =
            match request_typed::<ContentReply>(self.llm.as_ref(), &req).await {
                Ok(r) if !r.content.trim().is_empty() => {
                    let tags = if r.hashtags.is_empty() {
                        normalize_hashtags(&strategy.hashtag_ideas)
                    } else {
                        normalize_hashtags(&r.hashtags)
                    };
                    let score = r
                        .viral_score
                        .map(clamp_viral_score)
                        .unwrap_or_else(|| platform.fallback_score());
                    (r.content.trim().to_string(), tags, score, true)
                }
                Ok(_) => {
                    record_fallback(LlmTask::ViralContent, &LlmError::EmptyReply);
                    fallback_content(topic, platform, &strategy)
                }
                Err(e) => {
                    record_fallback(LlmTask::ViralContent, &e);
                    fallback_content(topic, platform, &strategy)
                }
            };

        self.patterns.push(ViralPattern {
            platform,
            content_type,
            hashtags: hashtags.clone(),
            viral_score: score,
        });

        info!(
            target: "viral",
            platform = platform.as_str(),
            kind = content_type.as_str(),
            score, ai_used,
            "content generated"
        );

        Ok(ViralContent {
            id: Uuid::new_v4(),
            content_type,
            platform,
            topic: topic.to_string(),
            content,
            hashtags,
            viral_score: score,
            engagement: Engagement::default(),
            ai_used,
            created_at: Utc::now(),
        })
    }

    /// `3 × duration_days` items; platforms rotate per item, types rotate post/story/video.
    /// At most `max_concurrency` generations are in flight; output keeps plan order.
    pub async fn create_viral_campaign(
        &self,
        req: &CampaignRequest,
    ) -> Result<Vec<ViralContent>, ViralError> {
        let topic = req.topic.trim();
        if topic.is_empty() {
            return Err(ViralError::EmptyTopic);
        }
        if req.platforms.is_empty() {
            return Err(ViralError::NoPlatforms);
        }
        if req.duration_days == 0 || req.duration_days > self.max_campaign_days {
            return Err(ViralError::InvalidDuration {
                got: req.duration_days,
                max: self.max_campaign_days,
            });
        }

        let total = 3 * req.duration_days as usize;
        let plan: Vec<(Platform, ContentType)> = (0..total)
            .map(|i| {
                (
                    req.platforms[i % req.platforms.len()],
                    CAMPAIGN_TYPES[i % CAMPAIGN_TYPES.len()],
                )
            })
            .collect();

        let results: Vec<Result<ViralContent, ViralError>> = stream::iter(plan)
            .map(|(platform, kind)| self.generate_viral_content(topic, platform, kind))
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let items = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        info!(target: "viral", items = items.len(), days = req.duration_days, "campaign generated");
        Ok(items)
    }

    /// Hashtags seen on `platform`, ranked by summed viral score.
    pub fn top_hashtags(&self, platform: Platform, n: usize) -> Vec<String> {
        let mut weight: HashMap<String, u64> = HashMap::new();
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        for (i, p) in self
            .patterns
            .snapshot()
            .into_iter()
            .filter(|p| p.platform == platform)
            .enumerate()
        {
            for tag in p.hashtags {
                first_seen.entry(tag.clone()).or_insert(i);
                *weight.entry(tag).or_default() += u64::from(p.viral_score);
            }
        }
        let mut ranked: Vec<(String, u64)> = weight.into_iter().collect();
        ranked.sort_by(|(ta, wa), (tb, wb)| {
            wb.cmp(wa)
                .then_with(|| first_seen.get(ta).cmp(&first_seen.get(tb)))
        });
        ranked.into_iter().take(n).map(|(t, _)| t).collect()
    }
}

fn fallback_content(
    topic: &str,
    platform: Platform,
    strategy: &ViralStrategy,
) -> (String, Vec<String>, u8, bool) {
    let hook = strategy
        .hooks
        .first()
        .cloned()
        .unwrap_or_else(|| format!("Big news about {topic}"));
    let content =
        format!("{hook}. {topic} is moving fast and we are building in the open. Follow along!");
    let mut tags = vec![topic_hashtag(topic)];
    tags.extend(strategy.hashtag_ideas.iter().cloned());
    (
        content,
        normalize_hashtags(&tags),
        platform.fallback_score(),
        false,
    )
}

const VIRAL_SYSTEM_PROMPT: &str = "You are a social media growth strategist. \
Respond with a single JSON object and nothing else.";

fn content_prompt(
    topic: &str,
    platform: Platform,
    content_type: ContentType,
    strategy: &ViralStrategy,
) -> String {
    format!(
        r##"Write a {kind} for {platform} about "{topic}".

Platform rules: {rules}
Trending topics: {trending}
Hooks to consider: {hooks}
Hashtag ideas: {tags}

Return JSON:
{{
  "content": "final post text",
  "hashtags": ["#..."],
  "viralScore": number from 0 to 100
}}"##,
        kind = content_type.as_str(),
        platform = platform.as_str(),
        rules = platform.guidance(),
        trending = strategy.trending_topics.join(", "),
        hooks = strategy.hooks.join(" | "),
        tags = strategy.hashtag_ideas.join(" "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::adapter::{LlmError, ScriptedClient};
    use serde_json::json;

    fn generator(llm: Arc<ScriptedClient>, max_concurrency: usize) -> ViralContentGenerator {
        ViralContentGenerator::new(
            llm,
            Arc::new(BoundedHistory::with_capacity(100)),
            max_concurrency,
            30,
        )
    }

    #[test]
    fn score_clamping() {
        assert_eq!(clamp_viral_score(-10.0), 0);
        assert_eq!(clamp_viral_score(0.0), 0);
        assert_eq!(clamp_viral_score(57.0), 57);
        assert_eq!(clamp_viral_score(150.0), 100);
        assert_eq!(clamp_viral_score(f64::NAN), 0);
        assert_eq!(clamp_viral_score(f64::INFINITY), 100);
    }

    #[test]
    fn hashtags_are_normalized() {
        let tags = normalize_hashtags(["AI", "#ai", " #Growth ", "", "#", "build in public"]);
        assert_eq!(tags, vec!["#AI", "#Growth", "#buildinpublic"]);
        assert_eq!(topic_hashtag("rust web3 tools"), "#RustWeb3Tools");
        assert_eq!(topic_hashtag("!!!"), "#Trending");
    }

    #[test]
    fn platform_parsing() {
        assert_eq!("X".parse::<Platform>().unwrap(), Platform::Twitter);
        assert!(matches!(
            "myspace".parse::<Platform>(),
            Err(ViralError::UnknownPlatform(_))
        ));
    }

    #[tokio::test]
    async fn two_calls_and_strategy_feeds_content_prompt() {
        let llm = Arc::new(ScriptedClient::new(|req| match req.task {
            LlmTask::ViralStrategy => Ok(json!({"hooks": ["HOOK-42"], "hashtagIdeas": ["#Idea"]})),
            _ => Ok(json!({"content": "hello", "hashtags": ["x"], "viralScore": 150})),
        }));
        let g = generator(llm.clone(), 2);
        let out = g
            .generate_viral_content("rust", Platform::Twitter, ContentType::Post)
            .await
            .unwrap();

        assert_eq!(out.viral_score, 100);
        assert_eq!(out.hashtags, vec!["#x"]);
        assert_eq!(out.engagement, Engagement::default());
        assert!(out.ai_used);
        let reqs = llm.requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].task, LlmTask::ViralStrategy);
        assert!(reqs[1].prompt.contains("HOOK-42"));
    }

    #[tokio::test]
    async fn prompts_spell_out_the_reply_schema() {
        let llm = Arc::new(ScriptedClient::new(|_| Ok(json!({"content": "ok"}))));
        let g = generator(llm.clone(), 1);
        g.generate_viral_content("rust", Platform::Linkedin, ContentType::Post)
            .await
            .unwrap();

        let reqs = llm.requests();
        let strategy = &reqs[0].prompt;
        assert!(strategy.contains(r##""hashtagIdeas": ["#..."],"##), "{strategy}");
        assert!(strategy.trim_end().ends_with('}'));
        let content = &reqs[1].prompt;
        assert!(content.contains(r##""hashtags": ["#..."],"##), "{content}");
        assert!(content.contains(r#""viralScore": number from 0 to 100"#));
        assert!(content.trim_end().ends_with('}'));
    }

    #[tokio::test]
    async fn each_call_falls_back_independently() {
        let llm = Arc::new(ScriptedClient::new(|req| match req.task {
            LlmTask::ViralStrategy => Err(LlmError::Transport("down".into())),
            _ => Ok(json!({"content": "made it", "viralScore": -10})),
        }));
        let g = generator(llm, 2);
        let out = g
            .generate_viral_content("coffee", Platform::Instagram, ContentType::Story)
            .await
            .unwrap();
        assert_eq!(out.content, "made it");
        assert_eq!(out.viral_score, 0);
        // Hashtags come from the fallback strategy.
        assert!(out.hashtags.contains(&"#Coffee".to_string()));

        let llm = Arc::new(ScriptedClient::new(|_| Err(LlmError::Status(500))));
        let g = generator(llm, 2);
        let out = g
            .generate_viral_content("coffee", Platform::Tiktok, ContentType::Video)
            .await
            .unwrap();
        assert_eq!(out.viral_score, 75);
        assert!(!out.ai_used);
        assert!(out.content.contains("coffee"));
    }

    #[tokio::test]
    async fn empty_topic_rejected() {
        let llm = Arc::new(ScriptedClient::new(|_| Err(LlmError::Disabled)));
        let g = generator(llm.clone(), 1);
        assert_eq!(
            g.generate_viral_content("  ", Platform::Twitter, ContentType::Post)
                .await
                .unwrap_err(),
            ViralError::EmptyTopic
        );
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn campaign_has_three_items_per_day_in_plan_order() {
        let llm = Arc::new(ScriptedClient::new(|req| match req.task {
            LlmTask::ViralStrategy => Ok(json!({})),
            _ => Ok(json!({"content": "c", "viralScore": 60})),
        }));
        let g = generator(llm.clone(), 3);
        let req = CampaignRequest {
            topic: "launch".into(),
            platforms: vec![Platform::Twitter, Platform::Linkedin],
            duration_days: 2,
        };
        let items = g.create_viral_campaign(&req).await.unwrap();
        assert_eq!(items.len(), 6);
        let platforms: Vec<_> = items.iter().map(|c| c.platform).collect();
        assert_eq!(
            platforms,
            vec![
                Platform::Twitter,
                Platform::Linkedin,
                Platform::Twitter,
                Platform::Linkedin,
                Platform::Twitter,
                Platform::Linkedin
            ]
        );
        let kinds: Vec<_> = items.iter().map(|c| c.content_type).collect();
        assert_eq!(kinds[..3], CAMPAIGN_TYPES);
        assert_eq!(llm.calls_for(LlmTask::ViralContent), 6);
    }

    #[tokio::test]
    async fn campaign_validation() {
        let llm = Arc::new(ScriptedClient::new(|_| Err(LlmError::Disabled)));
        let g = generator(llm, 1);
        let mut req = CampaignRequest {
            topic: "t".into(),
            platforms: vec![],
            duration_days: 1,
        };
        assert_eq!(g.create_viral_campaign(&req).await.unwrap_err(), ViralError::NoPlatforms);
        req.platforms = vec![Platform::Facebook];
        req.duration_days = 31;
        assert!(matches!(
            g.create_viral_campaign(&req).await.unwrap_err(),
            ViralError::InvalidDuration { got: 31, max: 30 }
        ));
    }

    #[tokio::test]
    async fn top_hashtags_ranked_by_score() {
        let llm = Arc::new(ScriptedClient::new(|req| {
            let tags = if req.prompt.contains("alpha") {
                json!(["#A", "#B"])
            } else {
                json!(["#B"])
            };
            match req.task {
                LlmTask::ViralStrategy => Ok(json!({})),
                _ => Ok(json!({"content": "c", "hashtags": tags, "viralScore": 40})),
            }
        }));
        let g = generator(llm, 1);
        g.generate_viral_content("alpha", Platform::Twitter, ContentType::Post).await.unwrap();
        g.generate_viral_content("beta", Platform::Twitter, ContentType::Post).await.unwrap();
        g.generate_viral_content("beta", Platform::Facebook, ContentType::Post).await.unwrap();

        assert_eq!(g.top_hashtags(Platform::Twitter, 5), vec!["#B", "#A"]);
        assert_eq!(g.top_hashtags(Platform::Twitter, 1), vec!["#B"]);
        assert!(g.top_hashtags(Platform::Linkedin, 5).is_empty());
    }
}
