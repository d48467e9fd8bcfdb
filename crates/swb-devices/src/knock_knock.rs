//! The knock-knock joke protocol

use swb_core::{menu, Payload, Protocol, BYE, PING, RESET};

pub const KNOCK_KNOCK_KEY: &str = "KnockKnockProtocol";

const START: &str = "Start";
const WHO_IS_THERE: &str = "Who's there?";
const YES: &str = "y";
const NO: &str = "n";

const JOKES: [(&str, &str); 5] = [
    ("Turnip", "Turnip the heat, it's cold in here!"),
    ("Little Old Lady", "I didn't know you could yodel!"),
    ("Atch", "Bless you!"),
    ("Who", "Is there an owl in here?"),
    ("Who Who", "Is there an echo in here?"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    SentKnockKnock,
    SentClue,
    Another,
}

/// Tells knock-knock jokes, one exchange per action
#[derive(Debug)]
pub struct KnockKnockProtocol {
    state: State,
    joke: usize,
    prompt: String,
}

impl KnockKnockProtocol {
    pub fn new() -> Self {
        Self {
            state: State::Waiting,
            joke: 0,
            prompt: "Want to hear a joke?".into(),
        }
    }

    fn clue(&self) -> &'static str {
        JOKES[self.joke].0
    }

    fn clue_reply(&self) -> String {
        format!("{} who?", self.clue())
    }

    fn commands(&self) -> Vec<String> {
        match self.state {
            State::Waiting => menu([START]),
            State::SentKnockKnock => menu([WHO_IS_THERE]),
            State::SentClue => menu([self.clue_reply()]),
            State::Another => menu([YES, NO]),
        }
    }

    fn respond(&mut self, action: &str, prompt: impl Into<String>) -> Payload {
        self.prompt = prompt.into();
        Payload::new(KNOCK_KNOCK_KEY)
            .with_action(action)
            .with_response(self.prompt.clone())
            .with_commands(self.commands())
    }

    fn reply(&mut self, action: &str) -> Payload {
        match self.state {
            State::Waiting if action == START => {
                self.state = State::SentKnockKnock;
                self.respond(action, "Knock! Knock!")
            }
            State::Waiting => {
                let unknown = format!("Unknown action: {}. {}", action, self.prompt);
                self.respond(action, unknown)
            }
            State::SentKnockKnock if action.eq_ignore_ascii_case(WHO_IS_THERE) => {
                self.state = State::SentClue;
                self.respond(action, self.clue())
            }
            State::SentKnockKnock => self.respond(
                action,
                "You're supposed to say \"Who's there?\"! Try again. Knock! Knock!",
            ),
            State::SentClue if action.eq_ignore_ascii_case(&self.clue_reply()) => {
                self.state = State::Another;
                let answer = format!("{} Want another? (y/n)", JOKES[self.joke].1);
                self.respond(action, answer)
            }
            State::SentClue => {
                let expected = self.clue_reply();
                self.state = State::SentKnockKnock;
                self.respond(
                    action,
                    format!(
                        "You're supposed to say \"{}\"! Try again. Knock! Knock!",
                        expected
                    ),
                )
            }
            State::Another if action.eq_ignore_ascii_case(YES) => {
                self.joke = (self.joke + 1) % JOKES.len();
                self.state = State::SentKnockKnock;
                self.respond(action, "Knock! Knock!")
            }
            State::Another if action.eq_ignore_ascii_case(NO) => {
                self.state = State::Waiting;
                self.respond(action, BYE)
            }
            State::Another => self.respond(action, "Want another? (y/n)"),
        }
    }
}

impl Default for KnockKnockProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for KnockKnockProtocol {
    fn key(&self) -> &str {
        KNOCK_KNOCK_KEY
    }

    fn process(&mut self, payload: Payload) -> Payload {
        match payload.effective_action() {
            PING => Payload::new(KNOCK_KNOCK_KEY)
                .with_action(PING)
                .with_response(self.prompt.clone())
                .with_commands(self.commands()),
            RESET => {
                *self = Self::new();
                self.respond(RESET, "Want to hear a joke?")
            }
            action => {
                let action = action.to_string();
                self.reply(&action)
            }
        }
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(protocol: &mut KnockKnockProtocol, action: &str) -> Payload {
        protocol.process(Payload::request(action))
    }

    #[test]
    fn test_full_joke() {
        let mut protocol = KnockKnockProtocol::new();
        assert_eq!(send(&mut protocol, "Start").response(), Some("Knock! Knock!"));

        let clue = send(&mut protocol, "Who's there?");
        assert_eq!(clue.response(), Some("Turnip"));
        assert_eq!(clue.commands(), ["Turnip who?", "Reset"]);

        let answer = send(&mut protocol, "Turnip who?");
        assert!(answer.response().unwrap().ends_with("Want another? (y/n)"));
        assert_eq!(answer.commands(), ["y", "n", "Reset"]);

        let next = send(&mut protocol, "y");
        assert_eq!(next.response(), Some("Knock! Knock!"));
        assert_eq!(send(&mut protocol, "Who's there?").response(), Some("Little Old Lady"));
    }

    #[test]
    fn test_no_ends_with_bye() {
        let mut protocol = KnockKnockProtocol::new();
        for action in ["Start", "Who's there?", "Turnip who?"] {
            send(&mut protocol, action);
        }
        let bye = send(&mut protocol, "n");
        assert!(bye.is_terminal());
        assert_eq!(bye.commands(), ["Start", "Reset"]);
    }

    #[test]
    fn test_wrong_reply_is_corrected() {
        let mut protocol = KnockKnockProtocol::new();
        send(&mut protocol, "Start");
        let wrong = send(&mut protocol, "Hello");
        assert!(wrong.response().unwrap().contains("Who's there?"));
        assert_eq!(wrong.commands(), ["Who's there?", "Reset"]);
    }

    #[test]
    fn test_ping_has_no_side_effects() {
        let mut protocol = KnockKnockProtocol::new();
        send(&mut protocol, "Start");
        let first = protocol.process(Payload::ping());
        let second = protocol.process(Payload::default());
        assert_eq!(first.response(), Some("Knock! Knock!"));
        assert_eq!(first, second.with_action(PING));
        assert_eq!(send(&mut protocol, "Who's there?").response(), Some("Turnip"));
    }

    #[test]
    fn test_reset_restarts() {
        let mut protocol = KnockKnockProtocol::new();
        send(&mut protocol, "Start");
        send(&mut protocol, "Who's there?");
        let reset = send(&mut protocol, "Reset");
        assert_eq!(reset.commands(), ["Start", "Reset"]);
        assert_eq!(send(&mut protocol, "Start").response(), Some("Knock! Knock!"));
    }
}
