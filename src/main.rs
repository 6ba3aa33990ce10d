use anyhow::{bail, Result};
use inquire::{Select, Text};
use novel2cast::core::config::Config;
use novel2cast::services::extractor::CharacterExtractor;
use novel2cast::services::llm::Llm;
use novel2cast::services::parser::ChapterParser;
use novel2cast::services::tuner::CharacterTuner;
use std::collections::BTreeMap;
use std::path::Path;

const USAGE: &str = "Usage: novel2cast <command> <file> [output]\n\
                     Commands:\n\
                     \x20 parse    <novel.txt|novel.epub> [output.yaml]   segment a novel into chapters\n\
                     \x20 extract  <novel.txt|novel.epub>                 build the character knowledge base\n\
                     \x20 tune     <characters.json>                      interactively tune characters";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("{}", USAGE);
        bail!("Missing arguments");
    }

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };

    let input = Path::new(&args[2]);

    match args[1].as_str() {
        "parse" => {
            let parser = ChapterParser::new(&config)?;
            let mut book = parser.parse_file(input)?;
            let output = args.get(3).map(Path::new);
            let path = parser.save(&mut book, output)?;
            println!(
                "Parsed {} chapters ({} characters of text) into {}",
                book.book_info.total_chapters,
                book.book_info.total_words,
                path.display()
            );
        }
        "extract" => {
            let parser = ChapterParser::new(&config)?;
            let book = parser.parse_file(input)?;
            if book.chapters.is_empty() {
                bail!("No chapters detected in {}", input.display());
            }

            let llm = Llm::from_config(&config)?;
            let extractor = CharacterExtractor::new(&config, &llm);
            let characters = extractor
                .extract_from_chapters(&book.chapters, Some(&book.book_info))
                .await?;

            println!(
                "Extracted {} characters ({} protagonists) from '{}'",
                characters.metadata.total_characters,
                characters.metadata.main_characters,
                book.book_info.title
            );
        }
        "tune" => {
            tune_interactive(&config, input).await?;
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("Unknown command: {}", other);
        }
    }

    Ok(())
}

async fn tune_interactive(config: &Config, path: &Path) -> Result<()> {
    let llm = Llm::from_config(config)?;
    let mut tuner = CharacterTuner::new(config, &llm);
    let count = tuner.load(path)?;
    println!("Loaded {} characters from {}", count, path.display());

    loop {
        let action = Select::new(
            "Action:",
            vec![
                "list", "view", "edit", "edit with prompt", "regenerate", "undo", "redo",
                "validate", "export", "quit",
            ],
        )
        .prompt()?;

        match action {
            "list" => {
                for character in tuner.list(&BTreeMap::new()) {
                    println!(
                        "{}  {}  ({})",
                        character.id,
                        character.name,
                        serde_json::to_string(&character.importance)?
                    );
                }
            }
            "view" => {
                let id = Text::new("Character id:").prompt()?;
                match tuner.get(&id) {
                    Some(character) => println!("{}", serde_json::to_string_pretty(character)?),
                    None => println!("No character with id {}", id),
                }
            }
            "edit" => {
                let id = Text::new("Character id:").prompt()?;
                let feature = Text::new("Feature (eyes, nose, ...):").prompt()?;
                let value = Text::new("New value:").prompt()?;
                match tuner.edit_feature(&id, &feature, &value) {
                    Some(_) => println!("Edited {} of {}", feature, id),
                    None => println!("Edit failed"),
                }
            }
            "edit with prompt" => {
                let id = Text::new("Character id:").prompt()?;
                let feature = Text::new("Feature (eyes, nose, ...):").prompt()?;
                let instruction = Text::new("Instruction:").prompt()?;
                match tuner.edit_feature_with_prompt(&id, &feature, &instruction).await {
                    Some(character) => println!(
                        "{} is now: {}",
                        feature,
                        character
                            .appearance
                            .structured_features
                            .get(&feature)
                            .map(String::as_str)
                            .unwrap_or("")
                    ),
                    None => println!("Edit failed"),
                }
            }
            "regenerate" => {
                let id = Text::new("Character id:").prompt()?;
                let prompt = Text::new("Description:").prompt()?;
                let keep = Text::new("Features to keep (comma separated, empty for none):")
                    .prompt()?;
                let keep: Vec<String> = keep
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                match tuner.regenerate_features(&id, &prompt, &keep).await {
                    Some(_) => println!("Regenerated features of {}", id),
                    None => println!("Regeneration failed"),
                }
            }
            "undo" => {
                println!("{}", if tuner.undo() { "Undone" } else { "Nothing to undo" });
            }
            "redo" => {
                println!("{}", if tuner.redo().await { "Redone" } else { "Nothing to redo" });
            }
            "validate" => {
                let id = Text::new("Character id:").prompt()?;
                match tuner.validate(&id) {
                    Some(report) if report.valid => println!("Valid"),
                    Some(report) => {
                        println!("Invalid, missing: {}", report.missing_features.join(", "));
                        for suggestion in &report.suggestions {
                            println!("  - {}", suggestion);
                        }
                    }
                    None => println!("No character with id {}", id),
                }
            }
            "export" => {
                let out = Text::new("Output path (empty for default):").prompt()?;
                let out = out.trim().to_string();
                let target = if out.is_empty() { None } else { Some(Path::new(&out).to_path_buf()) };
                match tuner.export(target.as_deref(), None) {
                    Ok(path) => println!("Exported to {}", path.display()),
                    Err(e) => println!("Export failed: {}", e),
                }
            }
            "quit" => break,
            _ => {}
        }
    }

    Ok(())
}
