use rand::seq::SliceRandom;

const PAINTER_QUOTES: [&str; 20] = [
    "We don't make mistakes, just happy little accidents.",
    "Talent is a pursued interest. Anything that you're willing to practice, you can do.",
    "There's nothing wrong with having a tree as a friend.",
    "You too can paint almighty pictures.",
    "In painting, you have unlimited power.",
    "I like to beat the brush.",
    "You can do anything you want to do. This is your world.",
    "The secret to doing anything is believing that you can do it.",
    "No pressure. Just relax and watch it happen.",
    "All you need to paint is a few tools, a little instruction, and a vision in your mind.",
    "Just let go, and fall like a little waterfall.",
    "Every day is a good day when you paint.",
    "The more you do it, the better it works.",
    "Find freedom on this canvas.",
    "It's life. It's interesting. It's fun.",
    "Believe that you can do it because you can do it.",
    "You can move mountains, rivers, trees, anything you want.",
    "You can put as many or as few highlights in your world as you want.",
    "The more you practice, the better you get.",
    "This is your creation, and it's just as unique and special as you are.",
];

pub fn random_quote() -> &'static str {
    PAINTER_QUOTES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(PAINTER_QUOTES[0])
}
