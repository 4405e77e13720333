/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New,
    List,
    Open(usize),
    Delete(usize),
    Model(String),
    Models,
    Stop,
    Save,
    Quit,
    Help,
    Submit(String),
    Empty,
    Invalid(String),
}

pub const HELP: &str = "\
/new          start a new chat
/list         list chats
/open N       open chat N from /list
/delete N     delete chat N from /list
/model NAME   use NAME for the open chat
/models       list available models
/stop         stop the current answer
/save         save chats now
/quit         exit";

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Submit(line.to_string());
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        match (name, argument) {
            ("new", "") => Self::New,
            ("list", "") => Self::List,
            ("open", index) => parse_index(index).map_or_else(|| Self::invalid(line), Self::Open),
            ("delete", index) => {
                parse_index(index).map_or_else(|| Self::invalid(line), Self::Delete)
            }
            ("model", "") => Self::invalid(line),
            ("model", model) => Self::Model(model.to_string()),
            ("models", "") => Self::Models,
            ("stop", "") => Self::Stop,
            ("save", "") => Self::Save,
            ("quit" | "exit", "") => Self::Quit,
            ("help", "") => Self::Help,
            _ => Self::invalid(line),
        }
    }

    fn invalid(line: &str) -> Self {
        Self::Invalid(line.to_string())
    }
}

/// 1-based index as shown by `/list`.
fn parse_index(raw: &str) -> Option<usize> {
    raw.parse::<usize>().ok().filter(|index| *index > 0)
}
