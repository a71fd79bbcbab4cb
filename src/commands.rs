/// Shell commands and autocomplete logic

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub usage: &'static str,
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "open",
    aliases: &["o", "load"],
    usage: "open",
    description: "Load the app in a new page",
  },
  Command {
    name: "get",
    aliases: &["g", "fetch"],
    usage: "get <path> [--html]",
    description: "Request a path from the current page",
  },
  Command {
    name: "deploy",
    aliases: &["d", "release"],
    usage: "deploy <version>",
    description: "Publish a new cache version",
  },
  Command {
    name: "update",
    aliases: &["u", "apply"],
    usage: "update",
    description: "Apply the waiting update and reload",
  },
  Command {
    name: "online",
    aliases: &["on"],
    usage: "online",
    description: "Restore network connectivity",
  },
  Command {
    name: "offline",
    aliases: &["off"],
    usage: "offline",
    description: "Drop network connectivity",
  },
  Command {
    name: "status",
    aliases: &["s", "st"],
    usage: "status",
    description: "Show session and registration state",
  },
  Command {
    name: "generations",
    aliases: &["gens", "caches"],
    usage: "generations",
    description: "List stored cache generations",
  },
  Command {
    name: "installable",
    aliases: &["i", "beforeinstallprompt"],
    usage: "installable",
    description: "Signal that the app can be installed",
  },
  Command {
    name: "accept",
    aliases: &["a", "install"],
    usage: "accept",
    description: "Install the app from the prompt",
  },
  Command {
    name: "dismiss",
    aliases: &["no", "later"],
    usage: "dismiss",
    description: "Dismiss the install prompt",
  },
  Command {
    name: "unregister",
    aliases: &["reset"],
    usage: "unregister",
    description: "Remove the cache worker registration",
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    usage: "help",
    description: "List commands",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    usage: "quit",
    description: "Exit",
  },
];

/// Get autocomplete suggestions for a given input
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    if cmd.name == input_lower {
      matches.push((cmd, 0));
      continue;
    }

    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
    }
  }

  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Resolve a typed word to one command.
///
/// Exact names and aliases always win; a prefix resolves only when it is
/// unambiguous.
pub fn resolve(input: &str) -> Option<&'static Command> {
  let suggestions = get_suggestions(input);
  let first = *suggestions.first()?;
  let input_lower = input.to_lowercase();
  let exact = first.name == input_lower || first.aliases.contains(&input_lower.as_str());
  if exact || suggestions.len() == 1 {
    Some(first)
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_input_returns_all() {
    let suggestions = get_suggestions("");
    assert_eq!(suggestions.len(), COMMANDS.len());
  }

  #[test]
  fn test_exact_match() {
    let suggestions = get_suggestions("update");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "update");
  }

  #[test]
  fn test_alias_match() {
    let suggestions = get_suggestions("off");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "offline");
  }

  #[test]
  fn test_prefix_match() {
    let suggestions = get_suggestions("gen");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "generations");
  }

  #[test]
  fn test_resolve_ambiguous_prefix() {
    // "o" is an alias of open; "onl" only prefixes online
    assert_eq!(resolve("o").map(|c| c.name), Some("open"));
    assert_eq!(resolve("onl").map(|c| c.name), Some("online"));
    assert_eq!(resolve("de").map(|c| c.name), Some("deploy"));
    // get and generations
    assert!(resolve("ge").is_none());
    assert!(resolve("zzz").is_none());
  }

  #[test]
  fn test_resolve_is_case_insensitive() {
    assert_eq!(resolve("QUIT").map(|c| c.name), Some("quit"));
  }
}
