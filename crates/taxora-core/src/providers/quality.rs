//! Response cleanup and the quality gate for small models
//!
//! Small local models and free inference endpoints often produce text that
//! is syntactically fine but useless (a few words, looping sentences, or an
//! unrelated ramble). The gate swaps such replies for a canned answer on the
//! same topic. This is a content decision, not a failure: the router never
//! sees it.

use std::collections::HashSet;
use tracing::info;

/// Replies longer than this are cut with an ellipsis
pub const MAX_REPLY_CHARS: usize = 2000;

const MIN_REPLY_CHARS: usize = 30;
const MIN_REPLY_WORDS: usize = 5;
const MIN_UNIQUE_WORD_RATIO: f64 = 0.4;

const PREAMBLES: &[&str] = &["Assistant:", "User:", "System:", "Human:"];

const FINANCE_TERMS: &[&str] = &[
    "money", "financial", "budget", "save", "saving", "invest", "bank", "account", "fund",
    "interest", "loan", "debt", "credit", "income", "expense", "cost", "tax", "insurance",
    "retirement", "compound", "principal", "return", "portfolio", "asset", "equity", "rupee",
    "dollar",
];

const OFF_TOPIC_PATTERNS: &[&str] = &[
    "paypal",
    "ebay",
    "shopping",
    "groceries",
    "husband",
    "wife",
    "business person",
    "online courses",
    "company has an active",
    "how do you know if",
    "whether it's just",
];

/// Strip role preambles and immediately repeated lines, then bound the length
pub fn clean_response(raw: &str) -> String {
    let mut text = raw.trim();
    loop {
        let before = text;
        for p in PREAMBLES {
            if let Some(rest) = text.strip_prefix(p) {
                text = rest.trim_start();
            }
        }
        if before == text {
            break;
        }
    }

    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || PREAMBLES.contains(&line) {
            continue;
        }
        let recent = &kept[kept.len().saturating_sub(3)..];
        if !recent.contains(&line) {
            kept.push(line);
        }
    }

    let joined = kept.join("\n");
    if joined.chars().count() > MAX_REPLY_CHARS {
        let cut: String = joined.chars().take(MAX_REPLY_CHARS).collect();
        format!("{}...", cut.trim_end())
    } else {
        joined
    }
}

/// Why a reply failed the gate, if it did
pub fn low_quality_reason(reply: &str) -> Option<&'static str> {
    let words: Vec<&str> = reply.split_whitespace().collect();
    if reply.trim().chars().count() < MIN_REPLY_CHARS || words.len() < MIN_REPLY_WORDS {
        return Some("too short");
    }

    let unique: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();
    if (unique.len() as f64) < (words.len() as f64) * MIN_UNIQUE_WORD_RATIO {
        return Some("repetitive");
    }

    let lower = reply.to_lowercase();
    if OFF_TOPIC_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some("off topic");
    }
    if !FINANCE_TERMS.iter().any(|t| lower.contains(t)) {
        return Some("no financial content");
    }
    None
}

/// Pass a cleaned reply through, or replace it with canned advice
pub fn review(reply: &str, question: &str) -> String {
    match low_quality_reason(reply) {
        None => reply.to_string(),
        Some(reason) => {
            info!("Reply rejected by quality gate ({}), using canned advice", reason);
            canned_advice(question).to_string()
        }
    }
}

/// Topic-keyed finance answer used when a model's reply is unusable
pub fn canned_advice(question: &str) -> &'static str {
    let q = question.to_lowercase();
    if q.contains("compound") && q.contains("interest") {
        COMPOUND_INTEREST
    } else if q.contains("tax") || q.contains("gst") {
        TAX
    } else if q.contains("debt") || q.contains("loan") {
        DEBT
    } else if q.contains("invest") {
        INVESTMENT
    } else if q.contains("save") || q.contains("saving") {
        SAVINGS
    } else if q.contains("budget") {
        BUDGET
    } else {
        GENERAL
    }
}

const COMPOUND_INTEREST: &str = "Compound interest means you earn interest on your original amount and on the interest already earned.\n\
For example, ₹10,000 at 10% a year grows to ₹11,000, then ₹12,100, then ₹13,310.\n\
Start early, invest regularly, and give it at least 10 years to see the effect.";

const SAVINGS: &str = "Effective savings strategies:\n\
1. Automate a transfer to savings on salary day.\n\
2. Follow the 50/30/20 rule: 50% needs, 30% wants, 20% savings.\n\
3. Build an emergency fund covering 3-6 months of expenses.\n\
4. Compare high-yield savings accounts for better interest.\n\
5. Track expenses monthly and cut what you don't value.";

const INVESTMENT: &str = "Investment basics:\n\
1. Keep an emergency fund before investing.\n\
2. Start with low-cost index funds for diversification.\n\
3. Invest monthly through a SIP regardless of market swings.\n\
4. Match your risk to your time horizon.\n\
5. Review your portfolio once or twice a year, not daily.";

const BUDGET: &str = "Creating a budget:\n\
1. Track all income and expenses for one month.\n\
2. Separate needs from wants.\n\
3. Set realistic limits for each category.\n\
4. Use an app or spreadsheet to stay consistent.\n\
5. Review and adjust every month.";

const DEBT: &str = "Managing debt:\n\
1. List every loan with its balance and interest rate.\n\
2. Pay the highest-interest debt first (avalanche) or the smallest balance first (snowball).\n\
3. Avoid new debt while paying down existing balances.\n\
4. Consider consolidation only if it lowers your overall interest cost.";

const TAX: &str = "Tax planning basics:\n\
1. Keep records of income, invoices and deductible expenses throughout the year.\n\
2. Use eligible deductions and tax-saving investments before the financial year ends.\n\
3. File GST and income tax returns before their due dates to avoid penalties.\n\
4. Consult a registered tax professional for business-specific questions.";

const GENERAL: &str = "I can help with your finances, including:\n\
- Savings strategies and emergency funds\n\
- Investment basics\n\
- Budgeting\n\
- Debt management\n\
- Tax planning\n\
Ask about any of these to get started.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_strips_preamble_and_repeats() {
        let raw = "Assistant: Save 20% of your income.\nSave 20% of your income.\nUser:\nReview monthly.";
        assert_eq!(
            clean_response(raw),
            "Save 20% of your income.\nReview monthly."
        );
    }

    #[test]
    fn test_clean_truncates_long_reply() {
        let raw = "budget ".repeat(500);
        let cleaned = clean_response(&raw);
        assert!(cleaned.ends_with("..."));
        assert!(cleaned.chars().count() <= MAX_REPLY_CHARS + 3);
    }

    #[test]
    fn test_good_reply_passes() {
        let reply = "Put 20% of your income into a savings account every month and keep an emergency fund.";
        assert_eq!(low_quality_reason(reply), None);
        assert_eq!(review(reply, "how do I save?"), reply);
    }

    #[test]
    fn test_short_reply_rejected() {
        assert_eq!(low_quality_reason("Save money."), Some("too short"));
    }

    #[test]
    fn test_repetitive_reply_rejected() {
        let reply = "save save save save save save save save save money money";
        assert_eq!(low_quality_reason(reply), Some("repetitive"));
    }

    #[test]
    fn test_off_topic_reply_rejected() {
        let reply = "My wife and I bought groceries with PayPal, which saved us money last week.";
        assert_eq!(low_quality_reason(reply), Some("off topic"));
    }

    #[test]
    fn test_non_financial_reply_rejected() {
        let reply = "The weather today is sunny with a light breeze from the west coast.";
        assert_eq!(low_quality_reason(reply), Some("no financial content"));
    }

    #[test]
    fn test_review_substitutes_topic_advice() {
        let replaced = review("ok", "What is compound interest?");
        assert_eq!(replaced, COMPOUND_INTEREST);
    }

    #[test]
    fn test_canned_topics() {
        assert_eq!(canned_advice("How should I save for a car?"), SAVINGS);
        assert_eq!(canned_advice("Where to invest 5000?"), INVESTMENT);
        assert_eq!(canned_advice("Help me budget"), BUDGET);
        assert_eq!(canned_advice("pay off my loan"), DEBT);
        assert_eq!(canned_advice("GST filing dates"), TAX);
        assert_eq!(canned_advice("hello"), GENERAL);
    }
}
