//! Scripted chat responder.
//!
//! Stateless keyword lookup: the input is lower-cased and walked against a
//! fixed, ordered table of (keyword group, canned response) entries; the
//! first group with any substring hit wins. No session memory, no external
//! calls, and no failure mode beyond falling through to the generic prompt.

pub const FALLBACK: &str = "That's an interesting question! I'm here to help with your learning journey. Could you rephrase or ask about:\n- Specific courses\n- Study techniques\n- Project guidance\n- Code problems\n\nWhat would you like to explore?";

/// Evaluated top to bottom; order is part of the behavior. The trailing
/// single-keyword entries are the low-priority course-name tier.
const RESPONSES: &[(&[&str], &str)] = &[
    (
        &["hello", "hi", "hey", "hola"],
        "Hello! How can I assist with your learning journey today?",
    ),
    (
        &["progress", "how am i doing", "my progress"],
        "Your progress is looking great! Based on your current pace, you're on track to complete your courses ahead of schedule. Keep up the excellent work!",
    ),
    (
        &["python", "python advanced", "advanced python"],
        "Python advanced topics:\n- Decorators and generators\n- Context managers\n- Metaclasses\n- Concurrency (async/await)\n- Advanced OOP patterns\n\nWant specific examples or practice exercises?",
    ),
    (
        &["web", "web development", "html", "css"],
        "Web development focus areas:\n- Responsive design with CSS Grid/Flexbox\n- JavaScript ES6+ features\n- React/Vue.js frameworks\n- REST APIs\n- Deployment strategies\n\nWhich area interests you most?",
    ),
    (
        &["database", "sql", "mongodb"],
        "Database concepts:\n- SQL queries and optimization\n- Database normalization\n- Indexing strategies\n- NoSQL vs SQL\n- ACID properties\n\nNeed help with specific database problems?",
    ),
    (
        &["help", "what can you do"],
        "I can help with:\n- Course explanations\n- Study techniques\n- Project ideas\n- Code debugging\n- Learning roadmap\n- Motivation tips\n\nWhat specific help do you need?",
    ),
    (
        &["study", "how to study", "learning tips"],
        "Effective study techniques:\n- Pomodoro (25min study + 5min break)\n- Active recall practice\n- Spaced repetition\n- Teach what you learn\n- Build projects\n\nTry the Pomodoro technique today!",
    ),
    (
        &["project", "project ideas"],
        "Project ideas:\n- Personal portfolio website\n- Todo app with database\n- Weather app with API\n- Blog with user authentication\n- E-commerce site\n\nWhich project excites you?",
    ),
    (
        &["thank", "thanks"],
        "You're welcome! Remember: consistent practice beats talent when talent doesn't practice. Keep coding!",
    ),
    (
        &["motivation", "stuck", "frustrated"],
        "Motivation boost: every expert was once a beginner. Your struggles today are building your expertise tomorrow. Take a break, then try again!",
    ),
    (
        &["deadline", "due", "assignment"],
        "Deadline strategy:\n1. Break the task into smaller parts\n2. Set mini-deadlines\n3. Focus on one thing at a time\n4. Ask for help if stuck\n5. Review and submit early\n\nYou've got this!",
    ),
    // Low-priority course-name tier.
    (
        &["javascript"],
        "Interesting question about JavaScript! I'd love to help you with that. Could you be more specific about what you're trying to learn or build?",
    ),
    (
        &["react"],
        "Interesting question about React! I'd love to help you with that. Could you be more specific about what you're trying to learn or build?",
    ),
];

pub fn respond(message: &str) -> &'static str {
    let message = message.to_lowercase();
    for (keywords, response) in RESPONSES {
        if keywords.iter().any(|kw| message.contains(kw)) {
            return response;
        }
    }
    FALLBACK
}
