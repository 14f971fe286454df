// Prompt text for each kind of background job.

pub const OVERVIEW_SYSTEM: &str = "You are a clinical assistant reviewing a health kiosk \
conversation in the background. Give a short overview of what the patient has described \
so far and point out anything the attending assistant should follow up on. Do not address \
the patient directly.";

pub const METRICS_SYSTEM: &str = "You are a precise medical data extraction system. Only \
extract values that are explicitly stated in the conversation. Never infer or calculate a \
value that was not mentioned. Respond with a JSON object with the fields bmi, height, \
weight, heartRate, bloodPressure and bloodOxygen.";

pub const COMPLETENESS_SYSTEM: &str = "You are an information extraction system. Only \
extract information that is explicitly stated in the conversation. Do not infer, analyze \
or make recommendations.";

pub const HYPOTHESIS_SYSTEM: &str = "You are a careful diagnostic reasoner. From the \
conversation, list the most plausible explanations for the patient's situation, each with \
the supporting evidence and the question that would best confirm or rule it out. Keep the \
list short and state uncertainty plainly.";

pub const SUMMARY_SYSTEM: &str = "Provide a comprehensive summary of this medical \
consultation. Start with a brief overview, then list the main topics discussed, key \
findings or concerns, recommendations or next steps, any analyzed files or documents, \
and important insights produced during the consultation. Use clear sections and bullet \
points where appropriate.";

pub const MESSAGE_SYSTEM: &str = "You read a single patient message from a health kiosk \
conversation. Note any symptoms, measurements, medications or concerns it contains in \
one or two sentences. Reply with nothing else.";

pub const CONTENT_SYSTEM: &str = "You analyze health related content shared during a \
kiosk consultation. Describe what it shows and anything clinically relevant.";

pub const REASONING_SYSTEM: &str = "You reason step by step about a patient's situation \
from the context given and state the conclusions the attending assistant should consider.";

pub fn metrics_prompt(conversation: &str) -> String {
    format!(
        r#"Extract the following health metrics from the conversation, responding in strict JSON.
{{
  "bmi": number | null,
  "height": number | null,
  "weight": number | null,
  "heartRate": number | null,
  "bloodPressure": {{ "systolic": number | null, "diastolic": number | null }} | null,
  "bloodOxygen": number | null
}}
Height is in cm, weight in kg, heart rate in bpm and blood oxygen in percent.

Conversation transcript:
{conversation}"#
    )
}

pub fn completeness_prompt(conversation: &str) -> String {
    format!(
        r#"Extract ONLY explicitly mentioned information from this conversation. Do not make assumptions or recommendations.
Respond in this JSON format:
{{
  "personalInfo": {{ "name": string | null, "dateOfBirth": string | null, "age": number | null }},
  "vitalSigns": {{
    "bloodPressure": {{ "systolic": number | null, "diastolic": number | null }} | null,
    "heartRate": number | null,
    "bloodOxygen": number | null
  }},
  "symptoms": string[] | null,
  "medications": string[] | null
}}

Conversation transcript:
{conversation}"#
    )
}

pub fn transcript_prompt(conversation: &str) -> String {
    format!("Conversation transcript:\n{}", conversation)
}
