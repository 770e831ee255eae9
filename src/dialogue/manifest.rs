//! Built-in tool declarations for the hospital appointment agent.
//!
//! These are specs only; implementations live behind HTTP endpoints declared
//! in `[[tools]]`, or are registered in-process by the embedding application.
//! A `[[tools]]` entry whose name matches one of these inherits the
//! description, schemas and acknowledgement phrase it does not set itself.

use super::tools::ToolSpec;
use serde_json::json;

pub const CHECK_AVAILABILITY: &str = "checkAvailability";
pub const BOOK_MEETING: &str = "bookMeeting";
pub const RECOMMEND_DOCTOR: &str = "recommendDoctor";
pub const SAVE_USER_RATING: &str = "saveUserRating";

pub fn clinic_tools() -> Vec<ToolSpec> {
    vec![
        check_availability(),
        book_meeting(),
        recommend_doctor(),
        save_user_rating(),
    ]
}

/// Look up a built-in spec by tool name.
pub fn find(name: &str) -> Option<ToolSpec> {
    clinic_tools().into_iter().find(|spec| spec.name == name)
}

fn check_availability() -> ToolSpec {
    ToolSpec {
        name: CHECK_AVAILABILITY.into(),
        description: "Checks availability for multiple meeting time slots in the hospital \
                      calendar for a specific doctor, ensuring all suggested times are in the future."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "slots": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "dateTime": {
                                "type": "string",
                                "description": "Meeting start in ISO 8601 (e.g. \"2023-07-20T14:30:00\"), local hospital time."
                            },
                            "duration": {
                                "type": "number",
                                "description": "Meeting length in minutes."
                            }
                        },
                        "required": ["dateTime", "duration"]
                    }
                },
                "doctor": {
                    "type": "string",
                    "description": "Name of the doctor to check."
                }
            },
            "required": ["slots", "doctor"]
        }),
        returns: Some(json!({
            "type": "object",
            "properties": {
                "results": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "dateTime": { "type": "string" },
                            "available": { "type": "boolean" }
                        }
                    }
                },
                "alternativeSlots": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Up to three alternative free slots, human readable."
                }
            }
        })),
        say: Some("Umm...".into()),
    }
}

fn book_meeting() -> ToolSpec {
    ToolSpec {
        name: BOOK_MEETING.into(),
        description: "Books a meeting in the hospital calendar for the caller with a specific \
                      doctor, ensuring the appointment is in the future."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "dateTime": {
                    "type": "string",
                    "description": "Meeting start in ISO 8601, local hospital time."
                },
                "email": {
                    "type": "string",
                    "format": "email",
                    "description": "Address the meeting invite is sent to."
                },
                "duration": {
                    "type": "number",
                    "description": "Meeting length in minutes. Default is 30."
                },
                "confirmedDateTime": {
                    "type": "boolean",
                    "description": "Whether the caller confirmed the date and time."
                },
                "confirmedEmail": {
                    "type": "boolean",
                    "description": "Whether the email was confirmed by spelling it out."
                },
                "doctor": {
                    "type": "string",
                    "description": "Name of the doctor for the appointment."
                }
            },
            "required": ["dateTime", "email", "doctor"]
        }),
        returns: Some(json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["success", "failure", "needs_date_time_confirmation", "needs_email_confirmation"]
                },
                "message": { "type": "string" },
                "needsConfirmation": { "type": "boolean" },
                "eventId": { "type": "string" },
                "scheduledTime": { "type": "string" }
            }
        })),
        say: Some("Great! I'll book that appointment for you now.".into()),
    }
}

fn recommend_doctor() -> ToolSpec {
    ToolSpec {
        name: RECOMMEND_DOCTOR.into(),
        description: "Recommends a doctor based on department and patient preferences.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "department": { "type": "string", "description": "The medical department needed." },
                "language": { "type": "string", "description": "Preferred language of the doctor (optional)." },
                "gender": { "type": "string", "description": "Preferred gender of the doctor (optional)." }
            },
            "required": ["department"]
        }),
        returns: Some(json!({
            "type": "object",
            "properties": {
                "status": { "type": "string", "enum": ["success", "no_match"] },
                "message": { "type": "string" },
                "doctor": { "type": "string" },
                "department": { "type": "string" },
                "languages": { "type": "array", "items": { "type": "string" } },
                "gender": { "type": "string" },
                "shift": { "type": "string", "description": "Day or Night." }
            }
        })),
        say: Some("Umm...".into()),
    }
}

fn save_user_rating() -> ToolSpec {
    ToolSpec {
        name: SAVE_USER_RATING.into(),
        description: "Saves the caller's ratings for the quality and effectiveness of the call.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "callQualityRating": {
                    "type": "number",
                    "description": "Rating from 1-5 for the quality and speed of the call.",
                    "minimum": 1,
                    "maximum": 5
                },
                "needsAddressedRating": {
                    "type": "number",
                    "description": "Rating from 1-5 for how well their needs were understood and addressed.",
                    "minimum": 1,
                    "maximum": 5
                }
            },
            "required": ["callQualityRating", "needsAddressedRating"]
        }),
        returns: Some(json!({
            "type": "object",
            "properties": {
                "status": { "type": "string", "enum": ["success", "failure"] },
                "message": { "type": "string" }
            }
        })),
        say: Some("Thank you for your feedback!".into()),
    }
}
