// Starter catalog inserted into an empty database.

pub struct SeedQuestion {
    pub question: &'static str,
    pub options: [&'static str; 4],
    pub correct_index: i64,
}

pub struct SeedLesson {
    pub id: i64,
    pub title: &'static str,
    pub questions: &'static [SeedQuestion],
}

pub struct SeedCourse {
    pub id: i64,
    pub title: &'static str,
    pub description: &'static str,
    pub lessons: &'static [SeedLesson],
}

pub const COURSES: &[SeedCourse] = &[
    SeedCourse {
        id: 1,
        title: "Arithmetic",
        description: "Addition, subtraction, multiplication and division.",
        lessons: &[
            SeedLesson {
                id: 1,
                title: "Lesson 1: Addition",
                questions: &[
                    SeedQuestion {
                        question: "What is 2 + 3?",
                        options: ["4", "5", "6", "3"],
                        correct_index: 1,
                    },
                    SeedQuestion {
                        question: "What is 7 + 1?",
                        options: ["6", "8", "9", "7"],
                        correct_index: 1,
                    },
                ],
            },
            SeedLesson {
                id: 2,
                title: "Lesson 2: Subtraction",
                questions: &[
                    SeedQuestion {
                        question: "What is 9 - 4?",
                        options: ["3", "4", "5", "6"],
                        correct_index: 2,
                    },
                    SeedQuestion {
                        question: "What is 10 - 3?",
                        options: ["6", "7", "8", "9"],
                        correct_index: 1,
                    },
                ],
            },
            SeedLesson {
                id: 3,
                title: "Lesson 3: Multiplication",
                questions: &[
                    SeedQuestion {
                        question: "What is 3 x 2?",
                        options: ["5", "6", "7", "8"],
                        correct_index: 1,
                    },
                    SeedQuestion {
                        question: "What is 4 x 3?",
                        options: ["10", "11", "12", "13"],
                        correct_index: 2,
                    },
                ],
            },
            SeedLesson {
                id: 4,
                title: "Lesson 4: Division",
                questions: &[
                    SeedQuestion {
                        question: "What is 12 / 3?",
                        options: ["3", "4", "5", "6"],
                        correct_index: 1,
                    },
                    SeedQuestion {
                        question: "What is 15 / 5?",
                        options: ["2", "3", "4", "5"],
                        correct_index: 1,
                    },
                ],
            },
        ],
    },
    SeedCourse {
        id: 2,
        title: "Equations and geometry",
        description: "First equations, areas and perimeters.",
        lessons: &[
            SeedLesson {
                id: 5,
                title: "Lesson 5: Unknowns",
                questions: &[
                    SeedQuestion {
                        question: "Which number solves 2x = 10?",
                        options: ["3", "4", "5", "6"],
                        correct_index: 2,
                    },
                    SeedQuestion {
                        question: "Which number solves x + 4 = 9?",
                        options: ["4", "5", "6", "7"],
                        correct_index: 1,
                    },
                ],
            },
            SeedLesson {
                id: 6,
                title: "Lesson 6: Shapes",
                questions: &[
                    SeedQuestion {
                        question: "Area of a square with side 4?",
                        options: ["8", "12", "16", "20"],
                        correct_index: 2,
                    },
                    SeedQuestion {
                        question: "Perimeter of a triangle with sides 3, 4, 5?",
                        options: ["10", "11", "12", "13"],
                        correct_index: 2,
                    },
                ],
            },
        ],
    },
];
