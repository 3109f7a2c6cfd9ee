//! LLM prompts for tree generation and retrieval.

/// Collection of prompts used across the pipeline.
pub struct Prompts;

impl Prompts {
    /// Prompt to detect if the given text contains a table of contents.
    pub fn toc_detector() -> &'static str {
        r#"Your job is to detect if there is a table of contents provided in the given text.

Given text: {content}

return the following JSON format:
{
    "thinking": <why do you think there is a table of contents in the given text>,
    "toc_detected": "<yes or no>"
}

Directly return the final JSON structure. Do not output anything else.
Please note: abstract, summary, notation list, figure list, table list, etc. are not table of contents."#
    }

    /// Prompt to transform a raw table of contents into structured JSON.
    pub fn toc_transformer() -> &'static str {
        r#"You are given a table of contents. Your job is to transform the whole table of contents into a JSON format that includes table_of_contents.

structure is the numeric system which represents the index of the hierarchy section in the table of contents. For example, the first section has structure index 1, the first subsection has structure index 1.1, the second subsection has structure index 1.2, etc.

The response should be in the following JSON format:
{
"table_of_contents": [
    {
        "structure": <structure index, "x.x.x" or None> (string),
        "title": <title of the section>,
        "page": <page number or None>
    },
    ...
    ]
}
You should transform the full table of contents in one go.
Directly return the final JSON structure, do not output anything else."#
    }

    /// Prompt to generate an initial outline from document text.
    pub fn generate_outline_init() -> &'static str {
        r#"You are an expert in extracting hierarchical tree structure, your task is to generate the tree structure of the document.

The structure variable is the numeric system which represents the index of the hierarchy section in the document. For example, the first section has structure index 1, the first subsection has structure index 1.1, the second subsection has structure index 1.2, etc.

For the title, you need to extract the original title from the text, only fix the space inconsistency.

The provided text contains tags like <physical_index_X> to indicate the start and end of page X.

For the physical_index, you need to extract the physical index of the page where the section starts. Keep the <physical_index_X> format.

The response should be in the following format:
    [
        {
            "structure": <structure index, "x.x.x"> (string),
            "title": <title of the section, keep the original title>,
            "physical_index": "<physical_index_X> (keep the format)"
        },
        ...
    ]

Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt to continue the outline over the next part of the document.
    pub fn generate_outline_continue() -> &'static str {
        r#"You are an expert in extracting hierarchical tree structure.
You are given the outline of the previous part of a document and the text of the current part.
Your task is to continue the outline to cover the current part.

The structure variable is the numeric system which represents the index of the hierarchy section in the document. For example, the first section has structure index 1, the first subsection has structure index 1.1, the second subsection has structure index 1.2, etc.

For the title, you need to extract the original title from the text, only fix the space inconsistency.

The provided text contains tags like <physical_index_X> to indicate the start and end of page X.

For the physical_index, you need to extract the physical index of the page where the section starts. Keep the <physical_index_X> format.

The response should be in the following format:
    [
        {
            "structure": <structure index, "x.x.x"> (string),
            "title": <title of the section, keep the original title>,
            "physical_index": "<physical_index_X> (keep the format)"
        },
        ...
    ]

Directly return the additional part of the final JSON structure. Do not output anything else."#
    }

    /// Prompt to propose child sections for an oversized node.
    pub fn subdivide_node() -> &'static str {
        r#"You are given one section of a document. The section is too large to use as a single unit, and your task is to split it into its natural subsections.

The provided text contains tags like <physical_index_X> to indicate the start and end of page X.

For each subsection, extract the original title from the text (only fix space inconsistency) and the physical index of the page where it starts. Keep the <physical_index_X> format. Subsections must appear in document order.

The response should be in the following format:
    [
        {
            "title": <title of the subsection, keep the original title>,
            "physical_index": "<physical_index_X> (keep the format)"
        },
        ...
    ]

If the section has no natural subsections, return an empty list [].
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt to score how faithfully proposed children cover a parent section.
    pub fn coverage_check() -> &'static str {
        r#"You are given a section of a document and a proposed list of subsections with their starting pages.

Your job is to judge how faithfully the proposed subsections cover the section: every part of the section should belong to exactly one subsection, subsection titles should actually appear in the text, and starting pages should be plausible.

Section pages: {start_page} to {end_page}.

Proposed subsections:
{children}

Section text:
{content}

Reply format:
{
    "thinking": <your assessment of the proposed subsections>,
    "accuracy": <a score between 0 and 1>
}
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt to generate a summary for a filing section.
    pub fn node_summary() -> &'static str {
        r#"You are given one section of a company financial filing (such as a 20-F or 10-K annual report). Generate a concise summary (2-3 sentences) describing what this section reports: the line items, disclosures, risks, segments or figures it covers.

Section Title: {title}

Section Content:
{content}

Provide ONLY the summary text, nothing else. Be specific about the financial information this section contains (business segments, reporting periods, amounts, accounting topics) so that someone searching the filing can decide whether this section answers their question."#
    }

    /// Prompt to generate a whole-document description from section summaries.
    pub fn doc_description() -> &'static str {
        r#"You are given the ordered section summaries of a document. Generate a one-paragraph description of the whole document: what kind of document it is and what it covers.

Section summaries:
{summaries}

Provide ONLY the description text, nothing else."#
    }

    /// Prompt to decompose a user query into atomic sub-questions.
    pub fn decompose_query() -> &'static str {
        r#"You are given a user question about a corpus of company financial filings. Split it into atomic sub-questions that can each be answered from a single company's filing for a single fiscal year.

If the question is already atomic, return it as the only sub-question. When a sub-question clearly targets one company or one fiscal year, tag it; otherwise use null.

User question: {query}

The response should be in the following JSON format:
{
    "sub_questions": [
        {
            "text": <the sub-question>,
            "target_company": <company name or ticker, or null>,
            "target_year": <fiscal year as integer, or null>
        },
        ...
    ]
}
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt for tree search: select node ids likely to contain the answer.
    pub fn tree_search() -> &'static str {
        r#"You are an expert at navigating hierarchical document structures to find relevant information.

You are given:
1. A question
2. The tree structure of a document, where each node has a node_id, a title and a summary

Your task is to identify the nodes that are most likely to contain information relevant to the question, using the titles and summaries.

Tree structure:
{tree_structure}

Question: {query}

Reply in JSON format:
{
    "thinking": <explain your reasoning about which nodes are relevant and why>,
    "node_list": ["<node_id>", "<node_id>", ...]
}

Order node ids by relevance (most relevant first). Only use node_id values that appear in the tree.
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt to synthesize a cited answer from retrieved context.
    pub fn answer_with_citations() -> &'static str {
        r#"You are a financial analyst answering a question from company filings. Answer the question using ONLY the provided context.

For every factual claim in your answer, include an inline citation of the form [<company>, <year>, p<start>] or [<company>, <year>, p<start>-<end>] using the company, fiscal year and page range of the context block the claim comes from.

If the context does not contain the information needed for a sub-question, do not invent an answer for it.

After the answer, output a JSON code block with this exact structure:
```json
{
    "citations": [
        {
            "company": <company>,
            "ticker": <ticker>,
            "fiscal_year": <year>,
            "node_id": <node_id of the cited block>,
            "section_path": <section title of the cited block>,
            "page": <first page cited>,
            "content_preview": <first 200 characters of the cited block>
        },
        ...
    ],
    "sub_question_coverage": [
        {
            "sub_question": <the sub-question text>,
            "answered": <true or false>
        },
        ...
    ],
    "conflicts": [<description of any contradictory statements between documents, or empty list>]
}
```

Question: {query}

Sub-questions:
{sub_questions}

Context:
{context}"#
    }

    /// System prompt for document structure analysis.
    pub fn system_document_analyzer() -> &'static str {
        "You are an expert document analyzer. You help extract structure, navigate content, and answer questions about documents. Always respond with valid JSON when requested."
    }

    /// System prompt for answer generation.
    pub fn system_financial_analyst() -> &'static str {
        "You are a careful financial analyst. You only state facts supported by the provided filings and you always cite your sources."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_are_not_empty() {
        assert!(!Prompts::toc_detector().is_empty());
        assert!(!Prompts::toc_transformer().is_empty());
        assert!(!Prompts::generate_outline_init().is_empty());
        assert!(!Prompts::generate_outline_continue().is_empty());
        assert!(!Prompts::subdivide_node().is_empty());
        assert!(!Prompts::coverage_check().is_empty());
        assert!(!Prompts::node_summary().is_empty());
        assert!(!Prompts::decompose_query().is_empty());
        assert!(!Prompts::tree_search().is_empty());
        assert!(!Prompts::answer_with_citations().is_empty());
    }

    #[test]
    fn test_templates_carry_placeholders() {
        assert!(Prompts::tree_search().contains("{tree_structure}"));
        assert!(Prompts::tree_search().contains("{query}"));
        assert!(Prompts::coverage_check().contains("{children}"));
        assert!(Prompts::answer_with_citations().contains("{context}"));
    }
}
