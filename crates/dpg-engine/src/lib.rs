//! Deterministic opportunity generation: rule tables, the rule catalog, and
//! the budget-gated delegate dispatcher with its deterministic fallback.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dpg_core::{
    AdminView, CompanyProfile, Difficulty, GenerationMetadata, GenerationSource, Opportunity,
    PublicView, StackDetail,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "dpg-engine";

/// Keyword-to-department rule for the unconditional pain-point classifier.
/// Matching is case-insensitive substring, same as every other table here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PainRule {
    pub department: String,
    pub contains_any: Vec<String>,
}

/// Replaceable product-content tables driving the rule catalog.
///
/// The matching semantics (substring, case-insensitive, OR across role and
/// industry) are fixed; only the word lists are configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTables {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub pain_departments: Vec<PainRule>,
    #[serde(default)]
    pub default_department: String,
    #[serde(default)]
    pub finance_tools: Vec<String>,
    #[serde(default)]
    pub sales_tools: Vec<String>,
    #[serde(default)]
    pub professional_role_terms: Vec<String>,
    #[serde(default)]
    pub professional_industry_terms: Vec<String>,
    #[serde(default)]
    pub monitored_tool: String,
}

fn default_version() -> u32 {
    1
}

impl Default for RuleTables {
    fn default() -> Self {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            version: 1,
            pain_departments: vec![
                PainRule {
                    department: "Finance".into(),
                    contains_any: list(&["pay", "bill", "invoic", "voice"]),
                },
                PainRule {
                    department: "Sales".into(),
                    contains_any: list(&["lead", "sell", "client"]),
                },
                PainRule {
                    department: "HR".into(),
                    contains_any: list(&["hir", "team"]),
                },
            ],
            default_department: "Operations".into(),
            finance_tools: list(&["QuickBooks", "Xero", "NetSuite"]),
            sales_tools: list(&["Salesforce", "HubSpot", "Pipedrive", "Airtable", "Notion"]),
            professional_role_terms: list(&["partner", "legal", "consult"]),
            professional_industry_terms: list(&["legal", "law", "consult"]),
            monitored_tool: "LinkedIn".into(),
        }
    }
}

impl RuleTables {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing rule tables yaml")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Department for the unconditional opportunity, from the pain point text.
    pub fn department_from_pain(&self, pain: &str) -> String {
        let pain = pain.to_lowercase();
        for rule in &self.pain_departments {
            if rule
                .contains_any
                .iter()
                .any(|needle| pain.contains(&needle.to_lowercase()))
            {
                return rule.department.clone();
            }
        }
        self.default_department.clone()
    }

    /// Professional-services classifier: OR across role and industry, each
    /// against its own term list. A missing industry matches nothing.
    pub fn is_professional_services(&self, role: &str, industry: Option<&str>) -> bool {
        let role = role.to_lowercase();
        let industry = industry.unwrap_or_default().to_lowercase();
        self.professional_role_terms
            .iter()
            .any(|t| role.contains(&t.to_lowercase()))
            || self
                .professional_industry_terms
                .iter()
                .any(|t| industry.contains(&t.to_lowercase()))
    }
}

/// The deterministic generation engine.
///
/// `generate` is a pure function of its input: at least one record, no two
/// records sharing a title, output in rule-evaluation order. Ranking is the
/// caller's concern.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    tables: RuleTables,
}

impl Engine {
    pub fn new(tables: RuleTables) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &RuleTables {
        &self.tables
    }

    pub fn generate(&self, profile: &CompanyProfile) -> Vec<Opportunity> {
        let profile = profile.normalized();
        let mut out: Vec<Opportunity> = Vec::new();
        let mut push = |opp: Opportunity| {
            // Dedup by title, first occurrence wins.
            if !out.iter().any(|o| o.title == opp.title) {
                out.push(opp);
            }
        };

        // Rule 1: unconditional personal pain-killer.
        push(silent_assistant(
            &profile,
            self.tables.department_from_pain(&profile.pain_point),
        ));

        // Rule 2: finance tooling slot, exactly one variant either way.
        let finance_tool = self
            .tables
            .finance_tools
            .iter()
            .find(|t| profile.stack_contains(t.as_str()));
        match finance_tool {
            Some(tool) => push(invoice_watchdog(tool)),
            None => push(receipt_auto_router()),
        }

        // Rule 3: sales/CRM tooling slot, exactly one variant either way.
        let sales_tool = self
            .tables
            .sales_tools
            .iter()
            .find(|t| profile.stack_contains(t.as_str()));
        match sales_tool {
            Some(tool) => push(omni_channel_nurture(tool)),
            None => push(lead_qualifier()),
        }

        // Rule 4: unconditional operations bridge.
        push(project_pulse());

        // Rule 5: additive, fires only for professional-services profiles.
        if self
            .tables
            .is_professional_services(&profile.role, profile.industry.as_deref())
        {
            push(case_miner());
        }

        // Rule 6: negative evidence, recommend monitoring only when the tool
        // is absent from the stack.
        if !profile.stack_contains(&self.tables.monitored_tool) {
            push(competitor_watchtower());
        }

        stamp(out, system_metadata(None))
    }
}

fn system_metadata(fallback_reason: Option<String>) -> GenerationMetadata {
    GenerationMetadata {
        source: GenerationSource::System,
        model: None,
        fallback_reason,
    }
}

fn stamp(mut records: Vec<Opportunity>, meta: GenerationMetadata) -> Vec<Opportunity> {
    for record in &mut records {
        record.generation_metadata = Some(meta.clone());
    }
    records
}

fn steps(items: &[&str]) -> Option<Vec<String>> {
    Some(items.iter().map(|s| s.to_string()).collect())
}

fn details(pairs: &[(&str, &str)]) -> Option<Vec<StackDetail>> {
    Some(
        pairs
            .iter()
            .map(|(tool, role)| StackDetail {
                tool: tool.to_string(),
                role: role.to_string(),
            })
            .collect(),
    )
}

fn silent_assistant(profile: &CompanyProfile, department: String) -> Opportunity {
    let pain = &profile.pain_point;
    let first_tool = profile
        .stack
        .first()
        .cloned()
        .unwrap_or_else(|| "Email API".to_string());
    Opportunity {
        title: "The Silent Assistant".into(),
        department,
        industry: profile.industry.clone(),
        public_view: PublicView {
            problem: format!("You identified \"{pain}\" as a major daily friction point."),
            solution_narrative: format!(
                "An intelligent digital assistant that intercepts \"{pain}\" tasks, understands \
                 the context regardless of format, and handles the execution instantly without \
                 you lifting a finger."
            ),
            value_proposition: "Eliminates cognitive load and context switching.".into(),
            roi_estimate: "10-15 hours/month saved".into(),
            detailed_explanation: Some(
                "This workflow acts as a virtual layer between you and the tedious task. Using \
                 extraction AI, it turns messy inputs (emails, voice notes, screenshots) into \
                 structured data and pushes it exactly where it needs to go."
                    .into(),
            ),
            example_scenario: Some(format!(
                "You forward a client email about \"{pain}\" to 'assistant@dewpoint.ai'. Within \
                 seconds, the system parses the request, updates your database, schedules the \
                 necessary follow-up, and sends you a Slack confirmation."
            )),
            walkthrough_steps: steps(&[
                "User forwards an email or voice note to the dedicated Agent address.",
                "System performs Entity Extraction to identify key dates, people, and intent.",
                "Agent checks calendar/database availability via API.",
                "Agent performs the action (updates record, sends invite, creates file).",
                "Confirmation summary sent back to User's preferred channel (Slack/Teams/Email).",
            ]),
        },
        admin_view: AdminView {
            tech_stack: vec![
                "Antigravity".into(),
                first_tool.clone(),
                "OpenAI GPT-4o".into(),
            ],
            stack_details: details(&[
                ("Antigravity", "Orchestration Layer"),
                (&first_tool, "Input Trigger Source"),
                ("OpenAI GPT-4o", "Entity Extraction & Intent Parsing"),
            ]),
            implementation_difficulty: Difficulty::Med,
            workflow_steps: "1. Ingest webhook/email 2. Parse intent via LLM 3. Extract \
                             structured JSON 4. Execute API call 5. Notify user."
                .into(),
            upsell_opportunity: "Monthly maintenance & prompt tuning retainer.".into(),
        },
        generation_metadata: None,
    }
}

fn invoice_watchdog(finance_tool: &str) -> Opportunity {
    Opportunity {
        title: "The Invoice Watchdog".into(),
        department: "Finance".into(),
        industry: None,
        public_view: PublicView {
            problem: "Duplicate invoices and creeping vendor costs often go unnoticed until \
                      it's too late."
                .into(),
            solution_narrative: "A 24/7 auditor that reads every incoming PDF invoice, compares \
                                 it against your contract terms, and alerts you only when it \
                                 finds a mistake."
                .into(),
            value_proposition: "Catches overbilling before payment is released.".into(),
            roi_estimate: "$2k - $10k recovered annually".into(),
            detailed_explanation: Some(
                "This system sits on top of your accounts payable workflow. It uses OCR to \
                 'read' every line item of every invoice and cross-references it with your \
                 approved vendor contracts and purchase orders."
                    .into(),
            ),
            example_scenario: Some(
                "A vendor submits an invoice for $5,000, which is 10% higher than the agreed \
                 rate. The Watchdog instantly flags this variance, pauses the payment in Xero, \
                 and drafts an email to the vendor asking for clarification."
                    .into(),
            ),
            walkthrough_steps: steps(&[
                "Vendor emails PDF invoice to billing@company.com.",
                "System triggers; OCR extracts Vendor Name, Line Items, and Total.",
                "Agent fetches 'Approved Rates' for this vendor from Database.",
                "Logic Check: Is New Price > Approved Rate? Is Invoice Duplicate?",
                "If Issue Found: Draft email to Vendor & alert Finance Manager.",
                "If Clean: Push to Xero/Quickbooks as 'Draft Bill' ready for 1-click approval.",
            ]),
        },
        admin_view: AdminView {
            tech_stack: vec![
                "Antigravity".into(),
                finance_tool.to_string(),
                "Azure Document Intelligence".into(),
            ],
            stack_details: details(&[
                ("Antigravity", "Logic Controller"),
                (finance_tool, "Accounting Ledger (Destination)"),
                (
                    "Azure Document Intelligence",
                    "Optical Character Recognition (OCR)",
                ),
            ]),
            implementation_difficulty: Difficulty::High,
            workflow_steps: "1. Watch Gmail attachment 2. OCR PDF 3. Match PO # in \
                             NetSuite/Xero 4. Verify line item variance > 5% 5. Slack Alert."
                .into(),
            upsell_opportunity: "Gain share of recovered revenue.".into(),
        },
        generation_metadata: None,
    }
}

fn receipt_auto_router() -> Opportunity {
    Opportunity {
        title: "Receipt Auto-Router".into(),
        department: "Finance".into(),
        industry: None,
        public_view: PublicView {
            problem: "Chasing employees for receipts is a low-value distraction.".into(),
            solution_narrative: "Automatically matches email receipts to credit card \
                                 transactions and categorizes them instantly."
                .into(),
            value_proposition: "End-of-month reconciliation becomes 1-click.".into(),
            roi_estimate: "5 hours/month saved".into(),
            detailed_explanation: Some(
                "By connecting to both your email server and your bank feed, this agent acts \
                 as a matchmaker. It identifies transaction pairs that humans often miss due \
                 to date discrepancies or vendor name variations."
                    .into(),
            ),
            example_scenario: Some(
                "An employee spends $50 at a client lunch. They snap a photo of the receipt. \
                 The system matches it to the Amex charge, categorizes it as 'Meals & \
                 Entertainment', and appends the image to the transaction record."
                    .into(),
            ),
            walkthrough_steps: steps(&[
                "Employee snaps photo of receipt or forwards email receipt.",
                "Agent extracts Date, Amount, Merchant, and Tax.",
                "Agent scans Bank Feed / Credit Card feed for matching transaction (+/- 2 days).",
                "Match Found: Attaches receipt image to Bank Record & Auto-Categorizes.",
                "Match Missing: Adds to 'Pending Receipts' queue and nags employee weekly.",
            ]),
        },
        admin_view: AdminView {
            tech_stack: vec![
                "Antigravity".into(),
                "Gmail API".into(),
                "Table Extractor".into(),
            ],
            stack_details: details(&[
                ("Antigravity", "Orchestration"),
                ("Gmail API", "Receipt Ingestion"),
                ("Table Extractor", "Data Parsing"),
            ]),
            implementation_difficulty: Difficulty::Low,
            workflow_steps: "1. Monitor inbox for 'receipt' 2. Extract Merchant/Date/Amount \
                             3. Match roughly with bank feed CSV."
                .into(),
            upsell_opportunity: "Implementation fee only.".into(),
        },
        generation_metadata: None,
    }
}

fn omni_channel_nurture(data_tool: &str) -> Opportunity {
    Opportunity {
        title: "The Omni-Channel Nurture".into(),
        department: "Sales".into(),
        industry: None,
        public_view: PublicView {
            problem: "Leads go cold because manual follow-up is too slow or generic.".into(),
            solution_narrative: "When a high-value prospect visits your pricing page, this \
                                 agent instantly researches them and drafts a hyper-personalized \
                                 video script and email for your rep to approve."
                .into(),
            value_proposition: "Increases response rates by 300%.".into(),
            roi_estimate: "$50k net new revenue/qtr".into(),
            detailed_explanation: Some(
                "Speed to lead is everything. This workflow eliminates the research phase for \
                 your SDRs. It aggregates data from LinkedIn, news sources, and company \
                 websites to create a comprehensive dossier and a tailored outreach message."
                    .into(),
            ),
            example_scenario: Some(
                "A VP from a target account visits your site. The system identifies them, \
                 pulls their recent LinkedIn posts, and drafts an email referencing their \
                 latest keynote speech, ready for your rep to hit 'Send'."
                    .into(),
            ),
            walkthrough_steps: steps(&[
                "Trigger: Lead Score > 80 or Visit to Pricing Page.",
                "Enrichment: Clearbit/Apollo API pulls Company Size, Funding, Tech Stack.",
                "Research: Agent searches LinkedIn for Lead's recent posts/articles.",
                "Synthesis: LLM writes custom opening line connecting their recent post to \
                 your value prop.",
                "Action: Draft created in HubSpot/Salesforce assigned to Rep for review.",
            ]),
        },
        admin_view: AdminView {
            tech_stack: vec![
                data_tool.to_string(),
                "LinkedIn Scraper".into(),
                "HeyGen API".into(),
                "OpenAI".into(),
            ],
            stack_details: details(&[
                (data_tool, "CRM / System of Record"),
                ("LinkedIn Scraper", "Lead Research"),
                ("OpenAI", "Copywriting Engine"),
                ("HeyGen API", "Video Personalization (Optional)"),
            ]),
            implementation_difficulty: Difficulty::High,
            workflow_steps: "1. Identify IP via Clearbit 2. Scrape LinkedIn profile 3. Generate \
                             personalization via LLM 4. Create Draft in System."
                .into(),
            upsell_opportunity: "High-value retainer for sales ops optimization.".into(),
        },
        generation_metadata: None,
    }
}

fn lead_qualifier() -> Opportunity {
    Opportunity {
        title: "The Lead Qualifier".into(),
        department: "Sales".into(),
        industry: None,
        public_view: PublicView {
            problem: "Wasting time talking to unqualified leads.".into(),
            solution_narrative: "Intelligently researches every new inquiry, scores them based \
                                 on your criteria, and drafts the perfect reply."
                .into(),
            value_proposition: "Focus time only on 5-star prospects.".into(),
            roi_estimate: "10 hours/week saved".into(),
            detailed_explanation: Some(
                "This agent acts as your first line of defense. It takes the limited info from \
                 a contact form (name, email, website) and enriches it with public data to \
                 determine if the lead fits your Ideal Customer Profile (ICP)."
                    .into(),
            ),
            example_scenario: Some(
                "A lead submits a form with a Gmail address. The system finds their LinkedIn, \
                 sees they are a college student, scores them as 'Low Priority', and sends a \
                 polite automated denial email with links to free resources."
                    .into(),
            ),
            walkthrough_steps: steps(&[
                "Lead submits Contact Form (Typeform/Webflow).",
                "Agent searches Company Name & Website to verify industry/size.",
                "Decision Gate: Is Company > 50 employees? Is Industry 'Target'?",
                "If YES: Mark as 'Qualified', Notify Sales Head via Slack.",
                "If NO: Send helpful, automated nurturance sequence (Self-Serve Path).",
            ]),
        },
        admin_view: AdminView {
            tech_stack: vec![
                "Antigravity".into(),
                "Google Search API".into(),
                "Browserless.io".into(),
            ],
            stack_details: details(&[
                ("Antigravity", "Logic Flow"),
                ("Google Search API", "Company Verification"),
                ("Browserless.io", "Web Scraping"),
            ]),
            implementation_difficulty: Difficulty::Med,
            workflow_steps: "1. Webhook from Contact Form 2. Search Company Name 3. Scrape \
                             'About Us' 4. Classify 'Good/Bad Fit' 5. Tag in Database."
                .into(),
            upsell_opportunity: "Monthly scraping credit markup.".into(),
        },
        generation_metadata: None,
    }
}

fn project_pulse() -> Opportunity {
    Opportunity {
        title: "The Project Pulse".into(),
        department: "Operations".into(),
        industry: None,
        public_view: PublicView {
            problem: "Project updates require constantly nagging the team for status.".into(),
            solution_narrative: "An observer that silently reads all project activity and \
                                 automatically updates your client dashboard so they never \
                                 have to ask 'where are we at?'."
                .into(),
            value_proposition: "Improves client trust and retention.".into(),
            roi_estimate: "Invaluable client goodwill".into(),
            detailed_explanation: Some(
                "Transparency builds trust. This workflow connects your internal project \
                 management tools (Jira, Trello, GitHub) with your external client \
                 communications, translating technical jargon into clear business progress \
                 updates."
                    .into(),
            ),
            example_scenario: Some(
                "Your dev team closes 5 tickets in Jira. The system summarizes this as \
                 'Completed Backend API Integration', updates the client's Notion portal, and \
                 posts a weekly summary to the #client-updates Slack channel."
                    .into(),
            ),
            walkthrough_steps: steps(&[
                "Scheduled Trigger: Every Friday at 4 PM.",
                "Agent fetches all 'Done' tickets from Jira/Trello for the week.",
                "Agent reads latest Git Commits linked to those tickets.",
                "Summarizer: LLM condenses technical tasks into 'Business Value' bullet points.",
                "Action: Updates Client Portal & Emails Weekly Report to Stakeholders.",
            ]),
        },
        admin_view: AdminView {
            tech_stack: vec![
                "Slack API".into(),
                "Jira API".into(),
                "Client Portal".into(),
            ],
            stack_details: details(&[
                ("Jira API", "Task Source"),
                ("Slack API", "Internal Notification"),
                ("Client Portal", "External View (Notion/Portal)"),
            ]),
            implementation_difficulty: Difficulty::Med,
            workflow_steps: "1. Ingest daily commits/tickets 2. Summarize progress via LLM \
                             3. Post to Notion/Portal 4. Slack Audit Log."
                .into(),
            upsell_opportunity: "Portal build-out services.".into(),
        },
        generation_metadata: None,
    }
}

fn case_miner() -> Opportunity {
    Opportunity {
        title: "The Case Miner".into(),
        department: "Knowledge".into(),
        industry: None,
        public_view: PublicView {
            problem: "Your firm sits on decades of PDF case files that are effectively \
                      invisible to your current team."
                .into(),
            solution_narrative: "An internal search engine that indexes every past \
                                 case/project, allowing staff to ask 'Have we solved a problem \
                                 like this before?' and get instant cited answers."
                .into(),
            value_proposition: "Monetize your dormant intellectual property.".into(),
            roi_estimate: "Reduces research time by 80%".into(),
            detailed_explanation: Some(
                "This 'Knowledge Graph' ingests your unstructured data (PDFs, Word Docs, \
                 Emails), chunks it into searchable segments, and allows you to chat with \
                 your firm's collective brain."
                    .into(),
            ),
            example_scenario: Some(
                "A junior associate needs to find a precedent for a specific contract clause. \
                 Instead of emailing partners, they ask the Case Miner, which instantly \
                 surfaces 3 relevant cases from 2018, 2021, and 2023."
                    .into(),
            ),
            walkthrough_steps: steps(&[
                "One-Time Ingest: Scrape Folder/SharePoint of old PDFs.",
                "Processing: OCR -> Chunking -> Vector Embedding.",
                "User Action: Staff queries 'Non-compete clause for biotech'.",
                "Retrieval: System finds top 5 relevant document chunks.",
                "Generation: LLM cites specific clauses and summarizes the precedent.",
            ]),
        },
        admin_view: AdminView {
            tech_stack: vec![
                "Antigravity".into(),
                "Pinecone (Vector DB)".into(),
                "LangChain".into(),
            ],
            stack_details: details(&[
                ("Antigravity", "Interface"),
                ("Pinecone", "Vector Semantic Database"),
                ("LangChain", "RAG Framework"),
            ]),
            implementation_difficulty: Difficulty::High,
            workflow_steps: "1. Ingest PDF archive 2. Chunk & Embed 3. Semantic Search UI."
                .into(),
            upsell_opportunity: "Enterprise Knowledge Base Retainer.".into(),
        },
        generation_metadata: None,
    }
}

fn competitor_watchtower() -> Opportunity {
    Opportunity {
        title: "The Competitor Watchtower".into(),
        department: "Strategy".into(),
        industry: None,
        public_view: PublicView {
            problem: "Competitors are launching moves you don't see until it's too late.".into(),
            solution_narrative: "A silent scout that monitors your top 5 competitors' websites, \
                                 hiring boards, and press releases daily, summarizing their \
                                 strategy in a weekly briefing."
                .into(),
            value_proposition: "Never be blindsided by market shifts.".into(),
            roi_estimate: "Strategic agility".into(),
            detailed_explanation: Some(
                "This is automated competitive intelligence. It tracks changes in DOM elements \
                 on competitor sites (pricing changes, new headers) and semantic shifts in \
                 their job postings to predict their next move."
                    .into(),
            ),
            example_scenario: Some(
                "Competitor X changes their H1 tag to focus on 'Enterprise'. The Watchtower \
                 notes this pivot, correlates it with 3 new 'Enterprise Sales' job postings, \
                 and alerts you that they are moving up-market."
                    .into(),
            ),
            walkthrough_steps: steps(&[
                "Setup: Input URLs of 5 Core Competitors.",
                "Daily Job: Scraper visits sites, snapshots DOM.",
                "Diff Check: Compare visual/text changes vs yesterday.",
                "Contextualize: If 'Pricing' page changed significantly, flag as High Priority.",
                "Digest: Send weekly email with screen captures of changes.",
            ]),
        },
        admin_view: AdminView {
            tech_stack: vec![
                "Antigravity".into(),
                "Browserless".into(),
                "Summarization LLM".into(),
            ],
            stack_details: details(&[
                ("Browserless", "Headless Browser Scraper"),
                ("Antigravity", "Scheduler"),
                ("Summarization LLM", "Insight Generator"),
            ]),
            implementation_difficulty: Difficulty::Med,
            workflow_steps: "1. Daily scrape of target URLs 2. Diff check for changes 3. LLM \
                             summarizes strategic intent."
                .into(),
            upsell_opportunity: "Market Intelligence Dashboard.".into(),
        },
        generation_metadata: None,
    }
}

/// Daily-spend quota consulted before the delegate path is attempted. When
/// the gate is closed the delegate call is skipped entirely, not
/// attempted-then-failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetGate {
    pub spend: f64,
    pub limit: f64,
    pub has_active_integration: bool,
}

impl BudgetGate {
    pub fn allow(&self) -> bool {
        self.has_active_integration && self.spend < self.limit
    }

    /// Reason string stamped on fallback records when the gate is closed.
    pub fn closed_reason(&self) -> &'static str {
        if !self.has_active_integration {
            "no active integration"
        } else {
            "budget exhausted"
        }
    }
}

impl Default for BudgetGate {
    fn default() -> Self {
        Self {
            spend: 0.0,
            limit: 5.0,
            has_active_integration: false,
        }
    }
}

impl BudgetGate {
    /// Gate for callers that opted into the delegate path: the integration
    /// counts as active, spend and limit come from `DPG_BUDGET_SPEND` /
    /// `DPG_BUDGET_LIMIT` (dollars, defaults 0 and 5).
    pub fn from_env() -> Self {
        let read = |name: &str, fallback: f64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        };
        Self {
            spend: read("DPG_BUDGET_SPEND", 0.0),
            limit: read("DPG_BUDGET_LIMIT", 5.0),
            has_active_integration: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegateResponse {
    pub opportunities: Vec<Opportunity>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("delegate timed out")]
    Timeout,
    #[error("daily budget exceeded")]
    BudgetExceeded,
    #[error("delegate returned no opportunities")]
    Empty,
    #[error("delegate http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("delegate response malformed: {0}")]
    Malformed(String),
}

impl DelegateError {
    /// Short cause string recorded as `fallback_reason` on fallback output.
    pub fn fallback_reason(&self) -> String {
        match self {
            DelegateError::Timeout => "timeout".into(),
            DelegateError::BudgetExceeded => "budget exhausted".into(),
            DelegateError::Empty => "empty delegate response".into(),
            DelegateError::Http(err) => format!("http error: {err}"),
            DelegateError::Malformed(msg) => format!("malformed response: {msg}"),
        }
    }
}

/// Optional external generator. The far side is a black box; the dispatcher
/// only depends on this contract.
#[async_trait]
pub trait GenerationDelegate: Send + Sync {
    async fn dispatch(&self, profile: &CompanyProfile) -> Result<DelegateResponse, DelegateError>;
}

#[derive(Debug, Clone)]
pub struct DelegateConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
}

impl DelegateConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("DPG_DELEGATE_URL")
                .unwrap_or_else(|_| "http://localhost:3000/api/generate".to_string()),
            model: std::env::var("DPG_DELEGATE_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            timeout: Duration::from_secs(
                std::env::var("DPG_DELEGATE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }
}

/// HTTP delegate posting the profile to a remote generation endpoint.
#[derive(Debug)]
pub struct HttpDelegate {
    client: reqwest::Client,
    config: DelegateConfig,
}

impl HttpDelegate {
    pub fn new(config: DelegateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building delegate http client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl GenerationDelegate for HttpDelegate {
    async fn dispatch(&self, profile: &CompanyProfile) -> Result<DelegateResponse, DelegateError> {
        let resp = self
            .client
            .post(&self.config.endpoint)
            .json(&serde_json::json!({
                "companyData": profile,
                "model": self.config.model,
            }))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DelegateError::Timeout
                } else {
                    DelegateError::Http(err)
                }
            })?;

        if resp.status().as_u16() == 429 {
            return Err(DelegateError::BudgetExceeded);
        }
        if !resp.status().is_success() {
            return Err(DelegateError::Malformed(format!(
                "status {}",
                resp.status()
            )));
        }

        let mut parsed: DelegateResponse = resp
            .json()
            .await
            .map_err(|err| DelegateError::Malformed(err.to_string()))?;
        if parsed.opportunities.is_empty() {
            return Err(DelegateError::Empty);
        }
        if parsed.model.is_none() {
            parsed.model = Some(self.config.model.clone());
        }
        Ok(parsed)
    }
}

/// Front door for generation: tries the budget-gated delegate, falls back to
/// the deterministic engine, and stamps provenance either way. The product
/// guarantee is that a caller always gets recommendations.
pub struct Dispatcher {
    engine: Engine,
    delegate: Option<Arc<dyn GenerationDelegate>>,
    gate: BudgetGate,
}

impl Dispatcher {
    pub fn deterministic(engine: Engine) -> Self {
        Self {
            engine,
            delegate: None,
            gate: BudgetGate::default(),
        }
    }

    pub fn with_delegate(
        engine: Engine,
        delegate: Arc<dyn GenerationDelegate>,
        gate: BudgetGate,
    ) -> Self {
        Self {
            engine,
            delegate: Some(delegate),
            gate,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn generate(&self, profile: &CompanyProfile) -> Vec<Opportunity> {
        let Some(delegate) = &self.delegate else {
            return self.engine.generate(profile);
        };

        if !self.gate.allow() {
            return self.fallback(profile, self.gate.closed_reason().to_string());
        }

        match delegate.dispatch(profile).await {
            Ok(response) => stamp(
                response.opportunities,
                GenerationMetadata {
                    source: GenerationSource::Ai,
                    model: response.model,
                    fallback_reason: None,
                },
            ),
            Err(err) => {
                warn!(error = %err, "delegate generation failed; using rule engine");
                self.fallback(profile, err.fallback_reason())
            }
        }
    }

    fn fallback(&self, profile: &CompanyProfile, reason: String) -> Vec<Opportunity> {
        stamp(
            self.engine.generate(profile),
            system_metadata(Some(reason)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn profile(stack: &[&str], pain: &str, role: &str, industry: Option<&str>) -> CompanyProfile {
        CompanyProfile {
            url: "https://acme.example".into(),
            industry: industry.map(str::to_string),
            role: role.into(),
            size: "Solopreneur".into(),
            stack: stack.iter().map(|s| s.to_string()).collect(),
            pain_point: pain.into(),
            name: None,
            email: None,
        }
    }

    fn titles(list: &[Opportunity]) -> Vec<&str> {
        list.iter().map(|o| o.title.as_str()).collect()
    }

    #[test]
    fn empty_stack_profile_still_generates() {
        let engine = Engine::default();
        let out = engine.generate(&profile(&[], "invoicing is manual", "Founder", None));
        assert!(!out.is_empty());
        assert_eq!(out[0].title, "The Silent Assistant");
        assert_eq!(out[0].department, "Finance");
    }

    #[test]
    fn titles_are_unique() {
        let engine = Engine::default();
        let out = engine.generate(&profile(
            &["QuickBooks", "HubSpot", "LinkedIn"],
            "billing chaos",
            "Managing Partner",
            Some("Law"),
        ));
        let unique: HashSet<&str> = titles(&out).into_iter().collect();
        assert_eq!(unique.len(), out.len());
    }

    #[test]
    fn finance_slot_is_exhaustive() {
        let engine = Engine::default();
        let with_tool = engine.generate(&profile(&["QuickBooks"], "x", "Founder", None));
        let without_tool = engine.generate(&profile(&[], "x", "Founder", None));

        let finance = |list: &[Opportunity]| {
            list.iter()
                .filter(|o| o.department == "Finance" && o.title != "The Silent Assistant")
                .map(|o| o.title.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(finance(&with_tool), vec!["The Invoice Watchdog"]);
        assert_eq!(finance(&without_tool), vec!["Receipt Auto-Router"]);
    }

    #[test]
    fn finance_variant_is_specialized_on_detected_tool() {
        let engine = Engine::default();
        let out = engine.generate(&profile(&["Xero"], "x", "Founder", None));
        let watchdog = out
            .iter()
            .find(|o| o.title == "The Invoice Watchdog")
            .unwrap();
        assert!(watchdog.admin_view.tech_stack.contains(&"Xero".to_string()));
    }

    #[test]
    fn sales_slot_is_exhaustive() {
        let engine = Engine::default();
        let with_tool = engine.generate(&profile(&["HubSpot"], "x", "Founder", None));
        let without_tool = engine.generate(&profile(&[], "x", "Founder", None));
        assert!(titles(&with_tool).contains(&"The Omni-Channel Nurture"));
        assert!(!titles(&with_tool).contains(&"The Lead Qualifier"));
        assert!(titles(&without_tool).contains(&"The Lead Qualifier"));
        assert!(!titles(&without_tool).contains(&"The Omni-Channel Nurture"));
    }

    #[test]
    fn professional_services_matches_role_or_industry() {
        let engine = Engine::default();
        let by_role = engine.generate(&profile(&[], "x", "Managing Partner", None));
        assert!(titles(&by_role).contains(&"The Case Miner"));

        let by_industry = engine.generate(&profile(&[], "x", "Founder", Some("Law Firm")));
        assert!(titles(&by_industry).contains(&"The Case Miner"));

        let neither = engine.generate(&profile(&[], "x", "Founder", Some("Retail")));
        assert!(!titles(&neither).contains(&"The Case Miner"));
    }

    #[test]
    fn missing_industry_does_not_break_conditional_rules() {
        let engine = Engine::default();
        let out = engine.generate(&profile(&[], "x", "Founder", None));
        assert!(!titles(&out).contains(&"The Case Miner"));
    }

    #[test]
    fn watchtower_fires_only_when_linkedin_absent() {
        let engine = Engine::default();
        let absent = engine.generate(&profile(&[], "x", "Founder", None));
        assert!(titles(&absent).contains(&"The Competitor Watchtower"));

        let present = engine.generate(&profile(&["LinkedIn"], "x", "Founder", None));
        assert!(!titles(&present).contains(&"The Competitor Watchtower"));
    }

    #[test]
    fn pain_classifier_covers_all_departments() {
        let tables = RuleTables::default();
        assert_eq!(tables.department_from_pain("late PAYments"), "Finance");
        assert_eq!(tables.department_from_pain("invoicing is manual"), "Finance");
        assert_eq!(tables.department_from_pain("chasing new leads"), "Sales");
        assert_eq!(tables.department_from_pain("hiring is slow"), "HR");
        assert_eq!(tables.department_from_pain("scheduling chaos"), "Operations");
    }

    #[test]
    fn rule_tables_load_from_yaml_override() {
        let yaml = r#"
version: 1
pain_departments:
  - department: Support
    contains_any: [ticket]
default_department: Operations
finance_tools: [FreshBooks]
sales_tools: [Close]
professional_role_terms: [architect]
professional_industry_terms: [construction]
monitored_tool: Crunchbase
"#;
        let tables = RuleTables::from_yaml_str(yaml).unwrap();
        assert_eq!(tables.department_from_pain("ticket backlog"), "Support");

        let engine = Engine::new(tables);
        let out = engine.generate(&profile(&["FreshBooks"], "x", "Founder", None));
        assert!(titles(&out).contains(&"The Invoice Watchdog"));
    }

    #[test]
    fn plain_engine_output_is_stamped_system_without_reason() {
        let engine = Engine::default();
        let out = engine.generate(&profile(&[], "x", "Founder", None));
        for opp in &out {
            let meta = opp.generation_metadata.as_ref().unwrap();
            assert_eq!(meta.source, GenerationSource::System);
            assert!(meta.fallback_reason.is_none());
        }
    }

    struct FailingDelegate(DelegateError);

    #[async_trait]
    impl GenerationDelegate for FailingDelegate {
        async fn dispatch(
            &self,
            _profile: &CompanyProfile,
        ) -> Result<DelegateResponse, DelegateError> {
            Err(match &self.0 {
                DelegateError::Timeout => DelegateError::Timeout,
                DelegateError::BudgetExceeded => DelegateError::BudgetExceeded,
                DelegateError::Empty => DelegateError::Empty,
                DelegateError::Malformed(m) => DelegateError::Malformed(m.clone()),
                DelegateError::Http(_) => DelegateError::Timeout,
            })
        }
    }

    struct EchoDelegate;

    #[async_trait]
    impl GenerationDelegate for EchoDelegate {
        async fn dispatch(
            &self,
            profile: &CompanyProfile,
        ) -> Result<DelegateResponse, DelegateError> {
            Ok(DelegateResponse {
                opportunities: Engine::default().generate(profile),
                model: Some("gpt-4o".into()),
            })
        }
    }

    fn open_gate() -> BudgetGate {
        BudgetGate {
            spend: 0.0,
            limit: 5.0,
            has_active_integration: true,
        }
    }

    #[tokio::test]
    async fn delegate_timeout_falls_back_with_stamped_reason() {
        let dispatcher = Dispatcher::with_delegate(
            Engine::default(),
            Arc::new(FailingDelegate(DelegateError::Timeout)),
            open_gate(),
        );
        let out = dispatcher
            .generate(&profile(&[], "x", "Founder", None))
            .await;
        assert!(!out.is_empty());
        for opp in &out {
            let meta = opp.generation_metadata.as_ref().unwrap();
            assert_eq!(meta.source, GenerationSource::System);
            assert_eq!(meta.fallback_reason.as_deref(), Some("timeout"));
        }
    }

    #[tokio::test]
    async fn closed_gate_skips_delegate_entirely() {
        struct PanickingDelegate;

        #[async_trait]
        impl GenerationDelegate for PanickingDelegate {
            async fn dispatch(
                &self,
                _profile: &CompanyProfile,
            ) -> Result<DelegateResponse, DelegateError> {
                panic!("delegate must not be called when the gate is closed");
            }
        }

        let gate = BudgetGate {
            spend: 6.0,
            limit: 5.0,
            has_active_integration: true,
        };
        let dispatcher =
            Dispatcher::with_delegate(Engine::default(), Arc::new(PanickingDelegate), gate);
        let out = dispatcher
            .generate(&profile(&[], "x", "Founder", None))
            .await;
        for opp in &out {
            let meta = opp.generation_metadata.as_ref().unwrap();
            assert_eq!(meta.source, GenerationSource::System);
            assert_eq!(meta.fallback_reason.as_deref(), Some("budget exhausted"));
        }
    }

    #[test]
    fn env_gate_is_open_by_default_for_delegate_callers() {
        let gate = BudgetGate::from_env();
        assert!(gate.has_active_integration);
        assert!(gate.allow());
    }

    #[tokio::test]
    async fn env_gate_wiring_reaches_a_healthy_delegate() {
        // The opt-in delegate path builds its gate from the environment;
        // that gate must not silently route everything to the fallback.
        let dispatcher = Dispatcher::with_delegate(
            Engine::default(),
            Arc::new(EchoDelegate),
            BudgetGate::from_env(),
        );
        let out = dispatcher
            .generate(&profile(&[], "x", "Founder", None))
            .await;
        let meta = out[0].generation_metadata.as_ref().unwrap();
        assert_eq!(meta.source, GenerationSource::Ai);
        assert!(meta.fallback_reason.is_none());
    }

    #[tokio::test]
    async fn successful_delegate_output_is_stamped_ai() {
        let dispatcher =
            Dispatcher::with_delegate(Engine::default(), Arc::new(EchoDelegate), open_gate());
        let out = dispatcher
            .generate(&profile(&[], "x", "Founder", None))
            .await;
        for opp in &out {
            let meta = opp.generation_metadata.as_ref().unwrap();
            assert_eq!(meta.source, GenerationSource::Ai);
            assert_eq!(meta.model.as_deref(), Some("gpt-4o"));
        }
    }
}
