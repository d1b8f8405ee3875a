use crate::runner::{ExecutionResult, ExitStatus};

/// Standing instructions for both model turns
pub fn system_prompt(input_root: &str, code_tag: &str) -> String {
    format!(
        r#"You are a data analysis assistant. You help users analyze CSV data files using Python and pandas.

When a user asks a question about their data:
1. Write Python code using pandas to answer the question, in a single ```{code_tag} fenced block
2. The CSV file path will be provided to you as {input_root}/[filename]
3. Always use proper error handling in your code
4. Return clear, concise answers based on the code execution results
5. If you need to perform calculations, write Python code to do so
6. Always read the CSV file first to understand its structure

Important guidelines:
- Use pandas.read_csv() to load the data
- Handle potential errors (missing columns, data type issues, etc.)
- Keep code concise and focused on answering the specific question
- Print results clearly so they can be parsed
- Do not use visualizations or save files (only print results)
- Do not import os, sys, subprocess, shutil or pickle, and do not call open(), eval() or exec()
- Only reference files under {input_root}

You have access to: pandas, numpy, matplotlib (for calculations only, no plotting)"#
    )
}

/// The new user turn for the code-generating call
pub fn question_turn(data_path: &str, question: &str) -> String {
    format!("The CSV file is located at: {data_path}\n\nQuestion: {question}")
}

/// The synthetic user turn carrying execution output into the second call
pub fn results_turn(result: &ExecutionResult) -> String {
    let mut text = match result.exit_status {
        ExitStatus::TimedOut => {
            "The code was executed but did not finish before the time limit and was stopped. Here is the output captured so far:".to_string()
        }
        ExitStatus::NonZero(code) => format!(
            "The code was executed but exited with status {code}. Here are the results:"
        ),
        _ => "The code was executed. Here are the results:".to_string(),
    };
    text.push_str(&format!(
        "\n\nStdout:\n{}\n\nStderr:\n{}",
        result.stdout, result.stderr
    ));
    if result.truncated {
        text.push_str("\n\n(Output was truncated at the size limit.)");
    }
    text.push_str("\n\nPlease provide a clear answer to my question based on these results.");
    text
}

/// Overview program used by the dataset summary
pub fn summary_program(data_path: &str) -> String {
    let escaped = data_path.replace('\\', "\\\\").replace('\'', "\\'");
    format!(
        r#"import pandas as pd

try:
    df = pd.read_csv('{escaped}')

    print("Dataset Overview:")
    print(f"- Rows: {{len(df)}}")
    print(f"- Columns: {{len(df.columns)}}")
    print(f"\nColumn Names: {{', '.join(df.columns.tolist())}}")
    print(f"\nData Types:")
    for col in df.columns:
        print(f"  - {{col}}: {{df[col].dtype}}")
    print(f"\nFirst 3 rows:")
    print(df.head(3).to_string())
except Exception as e:
    print(f"Error: {{str(e)}}")
"#
    )
}
