/// Bot commands recognised before text falls through to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Clear,
}

impl Command {
    /// Parses `/start`, `/clear` and their `/cmd@botname` forms. Trailing
    /// arguments are ignored; unknown commands return `None` and are treated as
    /// ordinary questions.
    pub fn parse(text: &str) -> Option<Self> {
        let first = text.trim_start().split_whitespace().next()?;
        let name = first.strip_prefix('/')?;
        let name = name.split_once('@').map_or(name, |(cmd, _bot)| cmd);
        match name.to_lowercase().as_str() {
            "start" => Some(Command::Start),
            "clear" => Some(Command::Clear),
            _ => None,
        }
    }
}
