//! Chain and pipeline registry
//!
//! Built once at startup from the built-in rules and handlers plus the
//! configured chains. Every name a chain or pipeline references is resolved
//! here, so a bad configuration fails before any message is processed.

use super::{handlers, rules, Context, Disposition, Handler, Rule};
use crate::message::{Message, MessageData};
use listrust_common::config::{ChainConfig, LinkActionConfig, PipelineConfig};
use listrust_common::{Error, Result};
use listrust_storage::MailingList;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_POSTING_CHAIN: &str = "default-posting-chain";
pub const DEFAULT_POSTING_PIPELINE: &str = "default-posting-pipeline";

/// What a link does when its rule matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Accept,
    Hold,
    Reject,
    Discard,
    /// Keep evaluating the current chain
    Defer,
    /// Continue at the start of another chain
    Jump(String),
}

impl LinkAction {
    fn disposition(&self) -> Option<Disposition> {
        match self {
            LinkAction::Accept => Some(Disposition::Accept),
            LinkAction::Hold => Some(Disposition::Hold),
            LinkAction::Reject => Some(Disposition::Reject),
            LinkAction::Discard => Some(Disposition::Discard),
            LinkAction::Defer | LinkAction::Jump(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub rule: String,
    pub action: LinkAction,
}

impl Link {
    pub fn new(rule: &str, action: LinkAction) -> Self {
        Self {
            rule: rule.to_string(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub description: String,
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub name: String,
    pub description: String,
    pub handlers: Vec<String>,
}

fn default_posting_chain() -> Chain {
    let mut links = vec![
        Link::new("loop", LinkAction::Discard),
        Link::new("banned-address", LinkAction::Discard),
    ];
    for rule in [
        "spam-flag",
        "administrivia",
        "implicit-dest",
        "max-recipients",
        "max-size",
        "no-subject",
        "nonmember-moderation",
    ] {
        links.push(Link::new(rule, LinkAction::Defer));
    }
    links.push(Link::new("any", LinkAction::Hold));
    links.push(Link::new("truth", LinkAction::Accept));

    Chain {
        name: DEFAULT_POSTING_CHAIN.to_string(),
        description: "The built-in moderation chain.".to_string(),
        links,
    }
}

fn default_posting_pipeline() -> Pipeline {
    Pipeline {
        name: DEFAULT_POSTING_PIPELINE.to_string(),
        description: "The built-in posting pipeline.".to_string(),
        handlers: ["cook-headers", "calculate-recipients", "after-delivery", "to-outgoing"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

fn link_from_config(chain: &str, link: &listrust_common::config::LinkConfig) -> Result<Link> {
    let action = match link.action {
        LinkActionConfig::Accept => LinkAction::Accept,
        LinkActionConfig::Hold => LinkAction::Hold,
        LinkActionConfig::Reject => LinkAction::Reject,
        LinkActionConfig::Discard => LinkAction::Discard,
        LinkActionConfig::Defer => LinkAction::Defer,
        LinkActionConfig::Jump => LinkAction::Jump(link.chain.clone().ok_or_else(|| {
            Error::Config(format!(
                "chain {}: jump link on rule {} names no target chain",
                chain, link.rule
            ))
        })?),
    };
    Ok(Link::new(&link.rule, action))
}

/// Resolved rules, handlers, chains and pipelines
pub struct ChainRegistry {
    rules: HashMap<&'static str, Arc<dyn Rule>>,
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
    chains: HashMap<String, Chain>,
    pipelines: HashMap<String, Pipeline>,
}

impl ChainRegistry {
    /// Registry holding only the built-in chain and pipeline
    pub fn builtin() -> Result<Self> {
        Self::from_config(&HashMap::new(), &HashMap::new())
    }

    pub fn from_config(
        chains: &HashMap<String, ChainConfig>,
        pipelines: &HashMap<String, PipelineConfig>,
    ) -> Result<Self> {
        let mut registry = Self {
            rules: rules::builtin().into_iter().map(|r| (r.name(), r)).collect(),
            handlers: handlers::builtin().into_iter().map(|h| (h.name(), h)).collect(),
            chains: HashMap::new(),
            pipelines: HashMap::new(),
        };

        let builtin_chain = default_posting_chain();
        registry.chains.insert(builtin_chain.name.clone(), builtin_chain);
        let builtin_pipeline = default_posting_pipeline();
        registry
            .pipelines
            .insert(builtin_pipeline.name.clone(), builtin_pipeline);

        for (name, config) in chains {
            let links = config
                .links
                .iter()
                .map(|link| link_from_config(name, link))
                .collect::<Result<Vec<_>>>()?;
            registry.chains.insert(
                name.clone(),
                Chain {
                    name: name.clone(),
                    description: config.description.clone().unwrap_or_default(),
                    links,
                },
            );
        }

        for (name, config) in pipelines {
            registry.pipelines.insert(
                name.clone(),
                Pipeline {
                    name: name.clone(),
                    description: config.description.clone().unwrap_or_default(),
                    handlers: config.handlers.clone(),
                },
            );
        }

        registry.validate()?;
        info!(
            chains = registry.chains.len(),
            pipelines = registry.pipelines.len(),
            "Chain registry loaded"
        );
        Ok(registry)
    }

    /// Every chain resolves its names, ends in a terminal catch-all, and
    /// never jumps back into itself
    fn validate(&self) -> Result<()> {
        for chain in self.chains.values() {
            for link in &chain.links {
                if !self.rules.contains_key(link.rule.as_str()) {
                    return Err(Error::UnknownRule(format!(
                        "{} (in chain {})",
                        link.rule, chain.name
                    )));
                }
                if let LinkAction::Jump(target) = &link.action {
                    if !self.chains.contains_key(target) {
                        return Err(Error::UnknownChain(format!(
                            "{} (jump target in chain {})",
                            target, chain.name
                        )));
                    }
                }
            }

            match chain.links.last() {
                Some(last) if last.rule == "truth" && last.action != LinkAction::Defer => {}
                _ => {
                    return Err(Error::Config(format!(
                        "chain {} must end with a terminal truth link",
                        chain.name
                    )))
                }
            }
        }

        for chain in self.chains.keys() {
            self.check_jumps(chain, &mut Vec::new())?;
        }

        for pipeline in self.pipelines.values() {
            for handler in &pipeline.handlers {
                if !self.handlers.contains_key(handler.as_str()) {
                    return Err(Error::UnknownHandler(format!(
                        "{} (in pipeline {})",
                        handler, pipeline.name
                    )));
                }
            }
        }

        for disposition in [
            Disposition::Accept,
            Disposition::Hold,
            Disposition::Reject,
            Disposition::Discard,
        ] {
            if !self.handlers.contains_key(disposition.handler_name()) {
                return Err(Error::UnknownHandler(disposition.handler_name().to_string()));
            }
        }
        Ok(())
    }

    fn check_jumps<'a>(&'a self, name: &'a str, path: &mut Vec<&'a str>) -> Result<()> {
        if path.contains(&name) {
            path.push(name);
            return Err(Error::Config(format!("chain jump cycle: {}", path.join(" -> "))));
        }
        path.push(name);
        if let Some(chain) = self.chains.get(name) {
            for link in &chain.links {
                if let LinkAction::Jump(target) = &link.action {
                    self.check_jumps(target, path)?;
                }
            }
        }
        path.pop();
        Ok(())
    }

    /// Ensure a list's chain and pipeline exist
    pub fn check_list(&self, list: &MailingList) -> Result<()> {
        if !self.chains.contains_key(&list.posting_chain) {
            return Err(Error::UnknownChain(format!(
                "{} (posting chain of {})",
                list.posting_chain, list.list_id
            )));
        }
        if !self.pipelines.contains_key(&list.posting_pipeline) {
            return Err(Error::Config(format!(
                "Unknown pipeline {} (posting pipeline of {})",
                list.posting_pipeline, list.list_id
            )));
        }
        Ok(())
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.get(name)
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.get(name)
    }

    pub fn rule(&self, name: &str) -> Option<&Arc<dyn Rule>> {
        self.rules.get(name)
    }

    fn handler(&self, name: &str) -> Result<&Arc<dyn Handler>> {
        self.handlers
            .get(name)
            .ok_or_else(|| Error::UnknownHandler(name.to_string()))
    }

    /// Run the list's posting chain and return its disposition, without
    /// firing the disposition's handler
    pub async fn evaluate(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &Message,
        msgdata: &mut MessageData,
    ) -> Result<Disposition> {
        let mut chain = self
            .chains
            .get(&list.posting_chain)
            .ok_or_else(|| Error::UnknownChain(list.posting_chain.clone()))?;

        'chains: loop {
            for link in &chain.links {
                let rule = self
                    .rules
                    .get(link.rule.as_str())
                    .ok_or_else(|| Error::UnknownRule(link.rule.clone()))?;

                let matched = rule.check(ctx, list, msg, msgdata).await?;
                if rule.record() {
                    if matched {
                        msgdata.record_hit(rule.name());
                        msgdata.add_reason(rule.description());
                    } else {
                        msgdata.record_miss(rule.name());
                    }
                }
                if !matched {
                    continue;
                }

                debug!(chain = %chain.name, rule = rule.name(), action = ?link.action, "Rule matched");
                if let Some(disposition) = link.action.disposition() {
                    return Ok(disposition);
                }
                if let LinkAction::Jump(target) = &link.action {
                    chain = self
                        .chains
                        .get(target)
                        .ok_or_else(|| Error::UnknownChain(target.clone()))?;
                    continue 'chains;
                }
            }
            return Err(Error::Internal(format!(
                "chain {} ended without a disposition",
                chain.name
            )));
        }
    }

    /// Evaluate the posting chain and fire the disposition's handler once
    pub async fn process(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &mut Message,
        msgdata: &mut MessageData,
    ) -> Result<Disposition> {
        let disposition = self.evaluate(ctx, list, msg, msgdata).await?;
        self.handler(disposition.handler_name())?
            .process(ctx, list, msg, msgdata)
            .await?;
        info!(
            list_id = %list.list_id,
            message_id = ?msg.message_id,
            disposition = %disposition,
            hits = ?msgdata.rule_hits,
            "Chain finished"
        );
        Ok(disposition)
    }

    /// Run the list's posting pipeline over an accepted message
    pub async fn run_pipeline(
        &self,
        ctx: &Context,
        list: &MailingList,
        msg: &mut Message,
        msgdata: &mut MessageData,
    ) -> Result<()> {
        let pipeline = self.pipelines.get(&list.posting_pipeline).ok_or_else(|| {
            Error::Config(format!("Unknown pipeline {}", list.posting_pipeline))
        })?;

        for name in &pipeline.handlers {
            self.handler(name)?.process(ctx, list, msg, msgdata).await?;
        }
        debug!(list_id = %list.list_id, pipeline = %pipeline.name, "Pipeline finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{context, test_list};
    use crate::message::tests::{anne_post, ANNE_POST};
    use crate::queue::{OUT, PIPELINE};
    use listrust_common::config::{Config, LinkConfig};
    use listrust_common::types::{DeliveryMode, MemberRole, RequestType};
    use listrust_storage::{CreateMember, ListSettings};
    use pretty_assertions::assert_eq;

    fn chain_of(links: &[(&str, LinkActionConfig, Option<&str>)]) -> ChainConfig {
        ChainConfig {
            description: None,
            links: links
                .iter()
                .map(|(rule, action, chain)| LinkConfig {
                    rule: rule.to_string(),
                    action: action.clone(),
                    chain: chain.map(|c| c.to_string()),
                })
                .collect(),
        }
    }

    async fn subscribe(ctx: &Context, list_id: &str, email: &str) {
        ctx.repos
            .members
            .add(CreateMember {
                list_id: list_id.to_string(),
                email: email.to_string(),
                role: MemberRole::Member,
                display_name: None,
                delivery_mode: DeliveryMode::Regular,
                preferred_language: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_nonmember_post_is_held() {
        let ctx = context();
        let list = test_list(&ctx).await;
        let registry = ChainRegistry::builtin().unwrap();

        let mut msg = anne_post();
        let mut msgdata = MessageData::default();
        let disposition = registry
            .process(&ctx, &list, &mut msg, &mut msgdata)
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Hold);
        assert_eq!(msgdata.rule_hits, vec!["nonmember-moderation"]);
        assert!(msgdata.rule_misses.contains(&"loop".to_string()));
        assert_eq!(
            ctx.requests
                .for_list(&list.list_id)
                .count_of(RequestType::HeldMessage)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_member_post_is_accepted() {
        let ctx = context();
        let list = test_list(&ctx).await;
        subscribe(&ctx, &list.list_id, "anne@example.com").await;
        let registry = ChainRegistry::builtin().unwrap();

        let mut msg = anne_post();
        let mut msgdata = MessageData::default();
        let disposition = registry
            .process(&ctx, &list, &mut msg, &mut msgdata)
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Accept);
        assert!(msgdata.rule_hits.is_empty());
        assert_eq!(ctx.queue.items(PIPELINE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_is_discarded_before_other_rules() {
        let ctx = context();
        let list = test_list(&ctx).await;
        let registry = ChainRegistry::builtin().unwrap();

        let raw = ANNE_POST.replace("X-BeenThere: other@example.org", "X-BeenThere: test@example.com");
        let mut msg = Message::parse(raw.as_bytes()).unwrap();
        let mut msgdata = MessageData::default();
        let disposition = registry
            .process(&ctx, &list, &mut msg, &mut msgdata)
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Discard);
        assert_eq!(msgdata.rule_hits, vec!["loop"]);
        assert!(ctx.queue.items(PIPELINE).await.unwrap().is_empty());
        assert_eq!(ctx.requests.for_list(&list.list_id).count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_jump_continues_in_target_chain() {
        let ctx = context();
        let mut settings = ListSettings::with_display_name("Strict");
        settings.posting_chain = "strict".to_string();
        let list = ctx.repos.lists.create("strict@example.com", settings).await.unwrap();
        subscribe(&ctx, &list.list_id, "anne@example.com").await;

        let chains = HashMap::from([(
            "strict".to_string(),
            chain_of(&[
                ("spam-flag", LinkActionConfig::Reject, None),
                ("truth", LinkActionConfig::Jump, Some(DEFAULT_POSTING_CHAIN)),
            ]),
        )]);
        let registry = ChainRegistry::from_config(&chains, &HashMap::new()).unwrap();

        let mut msgdata = MessageData::default();
        let disposition = registry
            .evaluate(&ctx, &list, &anne_post(), &mut msgdata)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Accept);

        let raw = ANNE_POST.replace("Subject:", "X-Spam-Flag: YES\r\nSubject:");
        let mut msgdata = MessageData::default();
        let disposition = registry
            .evaluate(&ctx, &list, &Message::parse(raw.as_bytes()).unwrap(), &mut msgdata)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Reject);
    }

    #[tokio::test]
    async fn test_pipeline_delivers_to_outgoing() {
        let ctx = context();
        let list = test_list(&ctx).await;
        subscribe(&ctx, &list.list_id, "bart@example.com").await;
        let registry = ChainRegistry::builtin().unwrap();

        let mut msg = anne_post();
        let mut msgdata = MessageData::default();
        registry
            .run_pipeline(&ctx, &list, &mut msg, &mut msgdata)
            .await
            .unwrap();

        assert_eq!(msgdata.recipients, vec!["bart@example.com"]);
        assert_eq!(msgdata.post_id, Some(2));
        assert_eq!(ctx.queue.items(OUT).await.unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_rule_is_rejected() {
        let chains = HashMap::from([(
            "typo".to_string(),
            chain_of(&[
                ("no-such-rule", LinkActionConfig::Hold, None),
                ("truth", LinkActionConfig::Accept, None),
            ]),
        )]);
        assert!(matches!(
            ChainRegistry::from_config(&chains, &HashMap::new()),
            Err(Error::UnknownRule(_))
        ));
    }

    #[test]
    fn test_chain_without_catch_all_is_rejected() {
        let chains = HashMap::from([(
            "partial".to_string(),
            chain_of(&[("spam-flag", LinkActionConfig::Discard, None)]),
        )]);
        assert!(matches!(
            ChainRegistry::from_config(&chains, &HashMap::new()),
            Err(Error::Config(_))
        ));

        let chains = HashMap::from([(
            "deferred".to_string(),
            chain_of(&[("truth", LinkActionConfig::Defer, None)]),
        )]);
        assert!(ChainRegistry::from_config(&chains, &HashMap::new()).is_err());
    }

    #[test]
    fn test_jump_cycle_is_rejected() {
        let chains = HashMap::from([
            (
                "a".to_string(),
                chain_of(&[("truth", LinkActionConfig::Jump, Some("b"))]),
            ),
            (
                "b".to_string(),
                chain_of(&[
                    ("spam-flag", LinkActionConfig::Jump, Some("a")),
                    ("truth", LinkActionConfig::Accept, None),
                ]),
            ),
        ]);
        assert!(matches!(
            ChainRegistry::from_config(&chains, &HashMap::new()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_unknown_jump_target_and_handler_are_rejected() {
        let chains = HashMap::from([(
            "lost".to_string(),
            chain_of(&[("truth", LinkActionConfig::Jump, Some("nowhere"))]),
        )]);
        assert!(matches!(
            ChainRegistry::from_config(&chains, &HashMap::new()),
            Err(Error::UnknownChain(_))
        ));

        let pipelines = HashMap::from([(
            "odd".to_string(),
            PipelineConfig {
                description: None,
                handlers: vec!["cook-headers".to_string(), "decorate".to_string()],
            },
        )]);
        assert!(matches!(
            ChainRegistry::from_config(&HashMap::new(), &pipelines),
            Err(Error::UnknownHandler(_))
        ));
    }

    #[test]
    fn test_configured_chains_load() {
        let config = Config::from_toml(
            r#"
[chains.strict]
links = [
    { rule = "banned-address", action = "discard" },
    { rule = "truth", action = "jump", chain = "default-posting-chain" },
]
"#,
        )
        .unwrap();
        let registry = ChainRegistry::from_config(&config.chains, &config.pipelines).unwrap();
        assert_eq!(registry.chain("strict").unwrap().links.len(), 2);
        assert!(registry.chain(DEFAULT_POSTING_CHAIN).is_some());
        assert!(registry.pipeline(DEFAULT_POSTING_PIPELINE).is_some());
    }
}
