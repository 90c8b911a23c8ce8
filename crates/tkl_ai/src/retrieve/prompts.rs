pub fn answer_prompt(question: &str, evidence: &[String]) -> String {
    let mut blocks = String::new();
    for line in evidence {
        blocks.push_str(line);
        blocks.push('\n');
    }

    format!(
        r#"You answer questions about technology podcasts using only the evidence below.

Rules (non-negotiable):
1. Use only the numbered evidence; no outside knowledge.
2. Cite evidence as [n] after every claim it supports.
3. If the evidence does not answer the question, reply exactly: Insufficient evidence.
4. Write short markdown; no preamble.

Question: {question}

Evidence:
{blocks}
Answer:"#
    )
}
